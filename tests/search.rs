use async_trait::async_trait;
use channel_annotate::config::{Config, RetrievalConfig};
use channel_annotate::gateway::{
    AnnotationBackend, AnnotationError, AnnotationOutput, AnnotationRequest, AnnotationResult,
    TagPayload,
};
use channel_annotate::ingest::ingest_messages;
use channel_annotate::models::{RawMessage, TaskKind};
use channel_annotate::search::{fetch_messages, similarity_search, top_tags, MessageFilter};
use channel_annotate::state;
use channel_annotate::{db, migrate};
use chrono::{NaiveDate, TimeZone, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Embeds every query to a fixed vector, or fails.
struct QueryEmbedder(Option<Vec<f32>>);

#[async_trait]
impl AnnotationBackend for QueryEmbedder {
    fn name(&self) -> &str {
        "query"
    }

    async fn annotate(
        &self,
        _request: &AnnotationRequest,
    ) -> Result<AnnotationResult, AnnotationError> {
        match &self.0 {
            Some(v) => Ok(AnnotationResult {
                backend: "query".to_string(),
                model: None,
                output: AnnotationOutput::Embedding(v.clone()),
            }),
            None => Err(AnnotationError::BackendTimeout {
                job_id: None,
                elapsed: std::time::Duration::from_secs(1),
            }),
        }
    }
}

fn raw(channel: &str, id: i64, day: u32, text: &str) -> RawMessage {
    RawMessage {
        channel: channel.to_string(),
        message_id: id,
        ts: Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
        permalink: None,
        text: text.to_string(),
        views: None,
        forwards: None,
        title: None,
        category: None,
    }
}

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("chan.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, pool)
}

fn limits() -> RetrievalConfig {
    RetrievalConfig::default()
}

async fn row_id(pool: &SqlitePool, message_id: i64) -> i64 {
    sqlx::query_scalar("SELECT id FROM messages WHERE message_id = ?")
        .bind(message_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn tag(pool: &SqlitePool, message_id: i64, tags: &[&str]) {
    let id = row_id(pool, message_id).await;
    let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    state::record_tag_success(pool, id, &tags, "job", &TagPayload::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_top_tags_count_then_code_point_order() {
    let (_tmp, pool) = setup().await;
    let messages: Vec<RawMessage> = (1..=6)
        .map(|i| raw("markettwits", i, 1, &format!("пост {}", i)))
        .collect();
    ingest_messages(&pool, &messages).await.unwrap();

    for i in 1..=5 {
        tag(&pool, i, &["ЦБ", "Рынок"]).await;
    }
    for i in 1..=3 {
        // Add ИИ to the first three without touching existing links.
        let id = row_id(&pool, i).await;
        let mut conn = pool.acquire().await.unwrap();
        let tag_id = state::upsert_tag(&mut conn, "ИИ").await.unwrap();
        state::upsert_message_tag(&mut conn, id, tag_id, "job", None)
            .await
            .unwrap();
    }

    let counts = top_tags(&pool, &limits(), &MessageFilter::default(), Some(10)).await.unwrap();
    let names: Vec<&str> = counts.iter().map(|c| c.canonical.as_str()).collect();
    assert_eq!(names, vec!["Рынок", "ЦБ", "ИИ"]);
    assert_eq!(counts[0].count, 5);
    assert_eq!(counts[2].count, 3);

    let limited = top_tags(&pool, &limits(), &MessageFilter::default(), Some(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_fetch_filters_and_order() {
    let (_tmp, pool) = setup().await;
    ingest_messages(
        &pool,
        &[
            raw("markettwits", 1, 1, "первый"),
            raw("markettwits", 2, 3, "второй"),
            raw("@RBC_news", 3, 2, "третий"),
            raw("markettwits", 4, 5, "четвёртый"),
        ],
    )
    .await
    .unwrap();
    tag(&pool, 2, &["Нефть"]).await;
    tag(&pool, 3, &["Нефть"]).await;

    let all = fetch_messages(&pool, &limits(), &MessageFilter::default(), Some(10), 0)
        .await
        .unwrap();
    let ids: Vec<i64> = all.iter().map(|h| h.message_id).collect();
    assert_eq!(ids, vec![4, 2, 3, 1]);

    let channel = MessageFilter {
        channel: Some("@MarketTwits".to_string()),
        ..Default::default()
    };
    let hits = fetch_messages(&pool, &limits(), &channel, Some(10), 1).await.unwrap();
    let ids: Vec<i64> = hits.iter().map(|h| h.message_id).collect();
    assert_eq!(ids, vec![2, 1]);

    let tagged = MessageFilter {
        tag: Some("Нефть".to_string()),
        ..Default::default()
    };
    let hits = fetch_messages(&pool, &limits(), &tagged, Some(10), 0).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].tags, vec!["Нефть".to_string()]);
    assert_eq!(hits[1].channel, "rbc_news");

    let range = MessageFilter {
        since: NaiveDate::from_ymd_opt(2024, 5, 2),
        until: NaiveDate::from_ymd_opt(2024, 5, 3),
        ..Default::default()
    };
    let hits = fetch_messages(&pool, &limits(), &range, Some(10), 0).await.unwrap();
    let ids: Vec<i64> = hits.iter().map(|h| h.message_id).collect();
    assert_eq!(ids, vec![2, 3]);
}

#[tokio::test]
async fn test_similarity_ranks_by_distance_then_recency() {
    let (_tmp, pool) = setup().await;
    ingest_messages(
        &pool,
        &[
            raw("markettwits", 1, 1, "близкий старый"),
            raw("markettwits", 2, 4, "близкий новый"),
            raw("markettwits", 3, 2, "далёкий"),
            raw("markettwits", 4, 3, "другая размерность"),
        ],
    )
    .await
    .unwrap();
    for (mid, v) in [
        (1, vec![1.0f32, 0.0]),
        (2, vec![2.0, 0.0]),
        (3, vec![0.0, 1.0]),
        (4, vec![1.0, 0.0, 0.0]),
    ] {
        let id = row_id(&pool, mid).await;
        state::record_embedding_success(&pool, id, "m", &v)
            .await
            .unwrap();
    }

    let embedder = QueryEmbedder(Some(vec![1.0, 0.0]));
    let hits = similarity_search(&pool, &embedder, &limits(), "ставка", &MessageFilter::default(), None, Some(10))
        .await
        .unwrap();
    let ids: Vec<i64> = hits.iter().map(|h| h.message_id).collect();
    assert_eq!(ids, vec![2, 1, 3]);
    assert!(hits[0].distance.abs() < 1e-9);
    assert!((hits[2].score - 0.0).abs() < 1e-9);

    let strict = similarity_search(
        &pool,
        &embedder,
        &limits(),
        "ставка",
        &MessageFilter::default(),
        Some(0.5),
        Some(10),
    )
    .await
    .unwrap();
    assert_eq!(strict.len(), 2);

    let one = similarity_search(&pool, &embedder, &limits(), "ставка", &MessageFilter::default(), None, Some(1))
        .await
        .unwrap();
    assert_eq!(one.len(), 1);
}

#[tokio::test]
async fn test_similarity_empty_or_unembeddable_query_is_empty() {
    let (_tmp, pool) = setup().await;
    ingest_messages(&pool, &[raw("markettwits", 1, 1, "пост")])
        .await
        .unwrap();
    let id = row_id(&pool, 1).await;
    state::record_embedding_success(&pool, id, "m", &[1.0, 0.0])
        .await
        .unwrap();

    let ok = QueryEmbedder(Some(vec![1.0, 0.0]));
    let hits = similarity_search(&pool, &ok, &limits(), "   ", &MessageFilter::default(), None, Some(10))
        .await
        .unwrap();
    assert!(hits.is_empty());

    let broken = QueryEmbedder(None);
    let hits = similarity_search(&pool, &broken, &limits(), "ставка", &MessageFilter::default(), None, Some(10))
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_stats_counts_tracks() {
    let (_tmp, pool) = setup().await;
    ingest_messages(
        &pool,
        &[
            raw("markettwits", 1, 1, "a1"),
            raw("markettwits", 2, 1, "a2"),
            raw("rbc_news", 3, 1, "b1"),
        ],
    )
    .await
    .unwrap();
    tag(&pool, 1, &["ЦБ"]).await;
    let id = row_id(&pool, 2).await;
    for _ in 0..5 {
        state::record_failure(&pool, TaskKind::Tag, id, "boom")
            .await
            .unwrap();
    }

    let stats = channel_annotate::stats::collect_stats(&pool, 5, 5)
        .await
        .unwrap();
    assert_eq!(stats.channels, 2);
    assert_eq!(stats.messages, 3);
    assert_eq!(stats.tagging.done, 1);
    assert_eq!(stats.tagging.pending, 1);
    assert_eq!(stats.tagging.poisoned, 1);
    assert_eq!(stats.embedding.pending, 3);
    assert_eq!(stats.by_channel[0].channel, "markettwits");
    assert_eq!(stats.by_channel[0].tagged, 1);
}

#[tokio::test]
async fn test_query_limits_are_clamped() {
    let (_tmp, pool) = setup().await;
    let messages: Vec<RawMessage> = (1..=8)
        .map(|i| raw("markettwits", i, 1, &format!("пост {}", i)))
        .collect();
    ingest_messages(&pool, &messages).await.unwrap();
    for i in 1..=8 {
        let name = format!("Тег{}", "А".repeat(i as usize));
        tag(&pool, i, &[name.as_str()]).await;
    }

    let limits = RetrievalConfig {
        default_limit: 3,
        max_limit: 5,
        top_tags_limit: 2,
        top_tags_max: 4,
        ..RetrievalConfig::default()
    };
    let all = MessageFilter::default();

    let negative = fetch_messages(&pool, &limits, &all, Some(-1), 0).await.unwrap();
    assert_eq!(negative.len(), 3);
    let oversized = fetch_messages(&pool, &limits, &all, Some(1000), 0).await.unwrap();
    assert_eq!(oversized.len(), 5);
    let missing = fetch_messages(&pool, &limits, &all, None, 0).await.unwrap();
    assert_eq!(missing.len(), 3);

    let negative = top_tags(&pool, &limits, &all, Some(-1)).await.unwrap();
    assert_eq!(negative.len(), 2);
    let oversized = top_tags(&pool, &limits, &all, Some(1000)).await.unwrap();
    assert_eq!(oversized.len(), 4);
}
