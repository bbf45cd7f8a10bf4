//! # Channel Annotate
//!
//! Annotation pipeline for public channel posts. Posts are ingested into
//! SQLite, tagged with canonical tags and embedded through an LLM backend,
//! then queried by channel, tag, date range and semantic similarity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────┐
//! │  ingest  │──▶│  pipeline  │──▶│   gateway    │   │  SQLite  │
//! │  (JSONL) │   │ tag / embed│   │ job ▸ direct │   │ messages │
//! └──────────┘   └─────┬──────┘   └──────────────┘   │ tags     │
//!                      │ canonical + state           │ vectors  │
//!                      └────────────────────────────▶└────┬─────┘
//!                                                         ▼
//!                                                   ┌──────────┐
//!                                                   │  search  │
//!                                                   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chan init
//! chan ingest posts.jsonl
//! chan tag pending
//! chan embed pending
//! chan top-tags --since 2024-05-01
//! chan search "ставка ЦБ"
//! chan run                      # periodic worker
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`aliases`] | Alias table layers and hot reload |
//! | [`canonical`] | Tag canonicalization and tag-set policy |
//! | [`text`] | Text preparation and tag candidates |
//! | [`signals`] | Inferred emoji and signal codes |
//! | [`gateway`] | Annotation backends with fallback |
//! | [`state`] | Per-message annotation state transitions |
//! | [`pipeline`] | Batch tagging and embedding |
//! | [`annotate_cmd`] | Annotation CLI commands and worker loop |
//! | [`ingest`] | JSONL ingestion |
//! | [`search`] | Structured fetch, top tags, similarity |
//! | [`stats`] | Progress overview |
//! | [`vector`] | Vector BLOBs and cosine distance |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod aliases;
pub mod annotate_cmd;
pub mod canonical;
pub mod config;
pub mod db;
pub mod gateway;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod signals;
pub mod state;
pub mod stats;
pub mod text;
pub mod vector;
