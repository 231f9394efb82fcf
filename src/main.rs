//! # Grounding Engine CLI (`gnd`)
//!
//! ## Usage
//!
//! ```bash
//! gnd --config ./config/gnd.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gnd init` | Create the SQLite database and apply the schema |
//! | `gnd ingest <tenant> <source> <file>` | Ingest one source file |
//! | `gnd ingest-dir <tenant> <dir>` | Ingest every `.txt`/`.md` under a directory |
//! | `gnd query <tenant> "<text>"` | Ranked fragments for a query |
//! | `gnd ask <tenant> "<text>"` | Grounded answer with citations |
//! | `gnd get <fragment-id>` | Print one fragment |
//! | `gnd tenants` | List tenants and their partitions |
//! | `gnd serve` | HTTP server plus analytics workers |
//! | `gnd analytics <action>` | Run consumers, inspect the poison queue, report |

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use grounding_engine::analytics::{MetricsSink, PoisonStore};
use grounding_engine::answer::{AnswerError, AnswerRequest};
use grounding_engine::app::App;
use grounding_engine::config::{self, Config};
use grounding_engine::ingest::{IngestMetadata, IngestReport};
use grounding_engine::query::QueryRequest;
use grounding_engine::{logging, migrate, server};

/// Grounding Engine: tenant-scoped retrieval, grounded answers, and
/// interaction analytics.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gnd.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "gnd", version, about = "Grounding Engine: tenant-scoped retrieval and grounded answers")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gnd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest one source file for a tenant.
    ///
    /// Unchanged fragments are skipped; fragments whose offsets no longer
    /// exist in the source are pruned.
    Ingest {
        tenant: String,
        source: String,
        file: PathBuf,
        /// Citation title. Defaults to the source id.
        #[arg(long)]
        title: Option<String>,
        /// Topic tag; may be repeated.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Ingest every `.txt` and `.md` file under a directory.
    ///
    /// Each file becomes one source, identified by its relative path.
    IngestDir { tenant: String, dir: PathBuf },

    /// Search a tenant's fragments.
    Query {
        tenant: String,
        text: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the raw JSON result.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question from a tenant's sources.
    Ask {
        tenant: String,
        text: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Print a fragment by id.
    Get { id: String },

    /// List configured and stored tenants.
    Tenants,

    /// Start the HTTP server (and analytics workers if enabled).
    Serve,

    /// Change-stream analytics.
    Analytics {
        #[command(subcommand)]
        action: AnalyticsAction,
    },
}

#[derive(Subcommand)]
enum AnalyticsAction {
    /// Run every consumer. With `--once`, drain the stream and exit.
    Run {
        #[arg(long)]
        once: bool,
    },
    /// List quarantined events.
    Poisoned,
    /// Re-run a quarantined event through its consumer.
    Replay { id: i64 },
    /// Drop a quarantined event.
    Discard { id: i64 },
    /// Print derived cost, usage, and health metrics.
    Report {
        /// Number of most-cited fragments to show.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest {
            tenant,
            source,
            file,
            title,
            tags,
        } => {
            let app = App::open(&cfg).await?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let metadata = IngestMetadata {
                title,
                topic_tags: tags.into_iter().collect::<BTreeSet<_>>(),
            };
            let report = app.ingestor.ingest(&tenant, &source, &text, &metadata).await?;
            print_report(&report);
            if report.status() == "failed" {
                bail!("ingestion of '{}' failed", source);
            }
        }
        Commands::IngestDir { tenant, dir } => {
            let app = App::open(&cfg).await?;
            let reports = app.ingestor.ingest_directory(&tenant, &dir).await?;
            for report in &reports {
                print_report(report);
            }
            println!("{} sources ingested for {}", reports.len(), tenant);
        }
        Commands::Query {
            tenant,
            text,
            top_k,
            json,
        } => {
            let app = App::open(&cfg).await?;
            let outcome = app
                .retriever()
                .search(&QueryRequest {
                    tenant_id: tenant,
                    query_text: text,
                    top_k,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else if !outcome.grounded {
                println!("No grounded fragments.");
                if let Some(code) = &outcome.error_code {
                    println!("error_code: {}", code);
                }
            } else {
                for (i, hit) in outcome.fragments.iter().enumerate() {
                    println!("{}. [{:.3}] {} ({})", i + 1, hit.score, hit.citation, hit.id);
                    println!("   {}", hit.text.replace('\n', " "));
                }
            }
        }
        Commands::Ask {
            tenant,
            text,
            session,
            top_k,
            json,
        } => {
            let app = App::open(&cfg).await?;
            let req = AnswerRequest {
                tenant_id: tenant,
                session_id: session,
                query_text: text,
                top_k,
            };
            match app.answers.answer(&req).await {
                Ok(resp) if json => println!("{}", serde_json::to_string_pretty(&resp)?),
                Ok(resp) => {
                    println!("{}", resp.answer);
                    for c in &resp.citations {
                        println!("  [{}] {}", c.marker, c.reference);
                    }
                    println!("({}, interaction {})", resp.outcome.as_str(), resp.interaction_id);
                }
                Err(AnswerError::Generation {
                    interaction_id,
                    source,
                }) => bail!("{} (interaction {})", source, interaction_id),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Get { id } => {
            let app = App::open(&cfg).await?;
            let Some(f) = app.store.get(&id).await? else {
                bail!("Fragment not found: {}", id);
            };
            println!("id:        {}", f.id);
            println!("tenant:    {}", f.tenant_id);
            println!("source:    {}", f.source_id);
            println!("citation:  {}", f.citation);
            println!("range:     {}..{}", f.start, f.end);
            println!("model:     {} ({} dims)", f.embedding_model_id, f.dims());
            if !f.topic_tags.is_empty() {
                let tags: Vec<&str> = f.topic_tags.iter().map(String::as_str).collect();
                println!("tags:      {}", tags.join(", "));
            }
            println!("---");
            println!("{}", f.text);
        }
        Commands::Tenants => {
            let app = App::open(&cfg).await?;
            let tenants = app.tenants().await?;
            if tenants.is_empty() {
                println!("No tenants.");
            }
            for t in tenants {
                let marker = if t.configured { "" } else { " (unconfigured)" };
                println!("{} ({}){}", t.tenant_id, t.display_name, marker);
                for (key, n) in &t.partitions {
                    println!("  {}  {} fragments", key, n);
                }
            }
        }
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Analytics { action } => run_analytics(&cfg, action).await?,
    }

    Ok(())
}

async fn run_analytics(cfg: &Config, action: AnalyticsAction) -> Result<()> {
    let app = App::open(cfg).await?;
    match action {
        AnalyticsAction::Run { once: true } => {
            let reports = app.processor().drain().await?;
            for (consumer, r) in reports {
                println!(
                    "{}: read {}, committed {}, poisoned {}",
                    consumer, r.read, r.committed, r.poisoned
                );
            }
        }
        AnalyticsAction::Run { once: false } => {
            let processor = Arc::new(app.processor());
            let (tx, rx) = watch::channel(false);
            let task = tokio::spawn(processor.run(rx));
            tokio::signal::ctrl_c().await?;
            let _ = tx.send(true);
            task.await??;
        }
        AnalyticsAction::Poisoned => {
            let entries = app.analytics.list().await?;
            if entries.is_empty() {
                println!("No poisoned events.");
            }
            for p in entries {
                println!(
                    "#{} {} interaction={} seq={} retries={} at={}\n    {}",
                    p.id,
                    p.consumer,
                    p.interaction_id,
                    p.token,
                    p.retry_count,
                    p.quarantined_at.to_rfc3339(),
                    p.error_message
                );
            }
        }
        AnalyticsAction::Replay { id } => {
            app.processor().replay(id).await?;
            println!("Replayed poisoned event {}", id);
        }
        AnalyticsAction::Discard { id } => {
            if !app.processor().discard(id).await? {
                bail!("No poisoned event with id {}", id);
            }
            println!("Discarded poisoned event {}", id);
        }
        AnalyticsAction::Report { top } => {
            let report = app.analytics.report(top).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn print_report(report: &IngestReport) {
    println!(
        "{}::{}  {}  stored={} unchanged={} failed={} pruned={}",
        report.tenant_id,
        report.source_id,
        report.status(),
        report.stored(),
        report.unchanged(),
        report.failed(),
        report.pruned
    );
    for f in report.fragments.iter().filter(|f| f.error.is_some()) {
        println!("  fragment {} failed: {}", f.ordinal, f.error.as_deref().unwrap_or(""));
    }
}
