//! Embedding vector storage and comparison.
//!
//! Vectors are stored in `embeddings.embedding` as little-endian `f32`
//! BLOBs and compared in Rust.

/// Encode a float vector as a BLOB.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`]. Trailing partial values are
/// ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`.
///
/// `None` for empty vectors, mismatched lengths or a zero vector, since
/// no meaningful angle exists.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return None;
    }

    Some((dot / denom).clamp(-1.0, 1.0))
}

/// Cosine distance `1 - similarity`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f64> {
    cosine_similarity(a, b).map(|s| 1.0 - s)
}
