//! # Channel Annotate CLI (`chan`)
//!
//! ```bash
//! chan --config ./config/chan.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chan init` | Create the SQLite database and run schema migrations |
//! | `chan ingest [file]` | Ingest JSONL post records (stdin when omitted) |
//! | `chan tag pending` | Tag one batch of pending messages |
//! | `chan embed pending` | Embed one batch of pending messages |
//! | `chan reset <tag\|embed>` | Make poisoned messages eligible again |
//! | `chan run` | Periodic tagging and embedding until Ctrl-C |
//! | `chan fetch` | List messages by channel, tag and date |
//! | `chan top-tags` | Most frequent tags |
//! | `chan search "<query>"` | Semantic similarity search |
//! | `chan stats` | Annotation progress |
//! | `chan aliases list\|check\|add` | Inspect and extend the alias table |
//!
//! Log verbosity follows `RUST_LOG` (default `warn`).

use channel_annotate::models::TaskKind;
use channel_annotate::search::MessageFilter;
use channel_annotate::{aliases, annotate_cmd, config, ingest, migrate, search, stats};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Channel post annotation: canonical tags, embeddings and retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/chan.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chan",
    about = "Channel Annotate — canonical tags, embeddings and search over channel posts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest post records, one JSON object per line.
    Ingest {
        /// Input file; stdin when omitted or `-`.
        path: Option<PathBuf>,
    },

    /// Tagging commands.
    Tag {
        #[command(subcommand)]
        action: PendingAction,
    },

    /// Embedding commands.
    Embed {
        #[command(subcommand)]
        action: PendingAction,
    },

    /// Reset attempts on unfinished messages so they are retried.
    Reset {
        /// Which track to reset.
        #[arg(value_enum)]
        task: TaskArg,

        /// A single message row id.
        #[arg(long, conflicts_with = "all_poisoned")]
        message: Option<i64>,

        /// Every message at the attempt ceiling.
        #[arg(long)]
        all_poisoned: bool,
    },

    /// Run the periodic worker until Ctrl-C.
    Run,

    /// List messages, newest first.
    Fetch {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Most frequent canonical tags.
    TopTags {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        json: bool,
    },

    /// Semantic similarity search.
    Search {
        /// Free-text query.
        query: String,

        #[command(flatten)]
        filter: FilterArgs,

        /// Minimum similarity (1 - cosine distance).
        #[arg(long)]
        min_score: Option<f64>,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        json: bool,
    },

    /// Show annotation progress.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Alias table management.
    Aliases {
        #[command(subcommand)]
        action: AliasAction,
    },
}

#[derive(Subcommand)]
enum PendingAction {
    /// Process one batch of eligible messages.
    Pending {
        /// Override the configured batch size.
        #[arg(long)]
        limit: Option<i64>,
    },
}

#[derive(Subcommand)]
enum AliasAction {
    /// Print the effective alias table.
    List,
    /// Report conflicting aliases; exits non-zero when there are any.
    Check,
    /// Store an alias in the database.
    Add { alias: String, canonical: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum TaskArg {
    Tag,
    Embed,
}

impl From<TaskArg> for TaskKind {
    fn from(t: TaskArg) -> Self {
        match t {
            TaskArg::Tag => TaskKind::Tag,
            TaskArg::Embed => TaskKind::Embed,
        }
    }
}

#[derive(Args)]
struct FilterArgs {
    /// Channel username, with or without `@`.
    #[arg(long)]
    channel: Option<String>,

    /// Tag; resolved through the alias table.
    #[arg(long)]
    tag: Option<String>,

    /// Inclusive start date (YYYY-MM-DD).
    #[arg(long)]
    since: Option<String>,

    /// Inclusive end date (YYYY-MM-DD).
    #[arg(long)]
    until: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> anyhow::Result<MessageFilter> {
        MessageFilter::parse(
            self.channel,
            self.tag,
            self.since.as_deref(),
            self.until.as_deref(),
        )
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path } => {
            ingest::run_ingest(&cfg, path.as_deref()).await?;
        }
        Commands::Tag {
            action: PendingAction::Pending { limit },
        } => {
            annotate_cmd::run_tag_pending(&cfg, limit).await?;
        }
        Commands::Embed {
            action: PendingAction::Pending { limit },
        } => {
            annotate_cmd::run_embed_pending(&cfg, limit).await?;
        }
        Commands::Reset {
            task,
            message,
            all_poisoned,
        } => {
            annotate_cmd::run_reset(&cfg, task.into(), message, all_poisoned).await?;
        }
        Commands::Run => {
            annotate_cmd::run_worker(&cfg).await?;
        }
        Commands::Fetch {
            filter,
            limit,
            offset,
            json,
        } => {
            search::run_fetch(&cfg, filter.into_filter()?, limit, offset, json).await?;
        }
        Commands::TopTags {
            filter,
            limit,
            json,
        } => {
            search::run_top_tags(&cfg, filter.into_filter()?, limit, json).await?;
        }
        Commands::Search {
            query,
            filter,
            min_score,
            limit,
            json,
        } => {
            search::run_search(&cfg, &query, filter.into_filter()?, min_score, limit, json)
                .await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Aliases { action } => match action {
            AliasAction::List => aliases::run_aliases_list(&cfg).await?,
            AliasAction::Check => aliases::run_aliases_check(&cfg).await?,
            AliasAction::Add { alias, canonical } => {
                aliases::run_aliases_add(&cfg, &alias, &canonical).await?
            }
        },
    }

    Ok(())
}
