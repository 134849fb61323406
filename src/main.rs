//! # mail-sorter CLI
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mail-sorter run` | Run extract → transform → load → sync once |
//! | `mail-sorter run-stage <name>` | Run a single stage on a JSON `StageData` document |
//! | `mail-sorter generate-config` | Print or write the default configuration as TOML |
//! | `mail-sorter validate-config <file>` | Check a TOML configuration file |
//! | `mail-sorter show-metrics` | Print the last exported run summary |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use mail_sorter::collaborators::{Classifier, Collaborators, Lazy, MailSource, MessageStore};
use mail_sorter::config::{ExtractSource, PipelineConfig};
use mail_sorter::error::{CollaboratorError, PipelineError};
use mail_sorter::llm::{LlmConfig, OpenAiClassifier};
use mail_sorter::mailbox::{ImapConfig, ImapMailbox};
use mail_sorter::metrics;
use mail_sorter::pipeline::{Pipeline, RunOptions, RunResult, StageData};
use mail_sorter::store::LibSqlStore;

#[derive(Parser)]
#[command(
    name = "mail-sorter",
    about = "Label incoming email with an LLM-chosen category",
    version
)]
struct Cli {
    /// TOML configuration file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline once.
    Run {
        /// Classify and log, but change nothing.
        #[arg(long)]
        dry_run: bool,

        /// Use placeholder categories and label actions as previews.
        #[arg(long)]
        preview: bool,

        /// Use a fixed test category instead of calling the classifier.
        #[arg(long)]
        test: bool,

        /// `mailbox` or `store`.
        #[arg(long)]
        source: Option<String>,

        /// Mailbox search query.
        #[arg(long)]
        query: Option<String>,

        /// Maximum number of messages to fetch.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run one stage against a JSON input document.
    RunStage {
        /// Stage name: extract, transform, load or sync.
        name: String,

        /// JSON `StageData` input. Defaults to empty.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Where to write the JSON output. Defaults to stdout.
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Write the default configuration as TOML.
    GenerateConfig {
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Parse and validate a configuration file.
    ValidateConfig { file: PathBuf },

    /// Print an exported JSON run summary.
    ShowMetrics {
        /// Defaults to `monitoring.metrics_path`.
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            dry_run,
            preview,
            test,
            source,
            query,
            limit,
        } => {
            let mut config = PipelineConfig::load(cli.config.as_deref())?;
            if let Some(source) = source {
                config.extract.source = source.parse::<ExtractSource>()?;
            }
            if let Some(query) = query {
                config.extract.query = query;
            }
            if let Some(limit) = limit {
                config.extract.max_results = Some(limit);
            }
            config.validate()?;
            init_tracing(&config.monitoring.log_level);

            let options = RunOptions {
                dry_run: dry_run.then_some(true),
                preview,
                test,
            };
            let mut pipeline = Pipeline::new(config.clone(), collaborators(&config));

            match pipeline.run(options).await {
                Ok(result) => {
                    print_run_result(&result);
                    if result.failed > 0 {
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    if let Some(partial) = e.partial() {
                        print_run_result(partial);
                    }
                    std::process::exit(1);
                }
            }
        }

        Commands::RunStage {
            name,
            input,
            output,
            dry_run,
        } => {
            let config = PipelineConfig::load(cli.config.as_deref())?;
            init_tracing(&config.monitoring.log_level);

            let data: StageData = match input {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
                None => StageData::Empty,
            };
            let mut pipeline = Pipeline::new(config.clone(), collaborators(&config));

            let result = match pipeline.run_stage(&name, data, dry_run).await {
                Ok(result) => result,
                Err(e @ PipelineError::Config(_)) => {
                    eprintln!("Error: {e}");
                    eprintln!("  stages: {}", pipeline.stage_names().join(", "));
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            };

            let json = serde_json::to_string_pretty(&result)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("Wrote {} {} record(s) to {}", result.len(), result.kind(), path.display());
                }
                None => println!("{json}"),
            }
        }

        Commands::GenerateConfig { output } => {
            let toml = PipelineConfig::default().to_toml_string()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, toml)?;
                    eprintln!("Wrote default configuration to {}", path.display());
                }
                None => print!("{toml}"),
            }
        }

        Commands::ValidateConfig { file } => {
            let config = PipelineConfig::from_toml_file(&file)?;
            config.validate()?;
            println!("{} is valid", file.display());
            println!("  source:     {}", config.extract.source);
            println!("  provider:   {} ({})", config.transform.provider, config.transform.model);
            println!("  categories: {}", config.transform.categories.len());
            println!("  database:   {}", config.sync.database_path);
        }

        Commands::ShowMetrics { file } => {
            let path = match file {
                Some(path) => path,
                None => {
                    let config = PipelineConfig::load(cli.config.as_deref())?;
                    PathBuf::from(config.monitoring.metrics_path)
                }
            };
            show_metrics(&path).await?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

// ── Collaborator wiring ─────────────────────────────────────────────

/// Collaborators are connected on first use, so dry and preview runs never
/// need credentials they do not touch.
fn collaborators(config: &PipelineConfig) -> Collaborators {
    let mailbox = Lazy::<dyn MailSource>::new("mailbox", || async {
        let imap = ImapConfig::from_env().map_err(|e| CollaboratorError::unavailable("mailbox", e))?;
        let mailbox = ImapMailbox::connect(imap).await?;
        Ok::<_, CollaboratorError>(Arc::new(mailbox) as Arc<dyn MailSource>)
    });

    let db_path = PathBuf::from(&config.sync.database_path);
    let store = Lazy::<dyn MessageStore>::new("store", move || {
        let db_path = db_path.clone();
        async move {
            let store = LibSqlStore::new_local(&db_path).await?;
            Ok::<_, CollaboratorError>(Arc::new(store) as Arc<dyn MessageStore>)
        }
    });

    let transform = config.transform.clone();
    let classifier = Lazy::<dyn Classifier>::new("classifier", move || {
        let transform = transform.clone();
        async move {
            let llm = LlmConfig::from_env(&transform)
                .map_err(|e| CollaboratorError::unavailable("classifier", e))?;
            let classifier = OpenAiClassifier::new(llm)?;
            Ok::<_, CollaboratorError>(Arc::new(classifier) as Arc<dyn Classifier>)
        }
    });

    Collaborators::new(mailbox, store, classifier)
}

// ── Output ──────────────────────────────────────────────────────────

fn print_run_result(result: &RunResult) {
    println!("Run {}", result.run_id);
    println!("  duration:   {:.2}s", result.duration().num_milliseconds() as f64 / 1000.0);
    println!("  stages:     {}", result.stages_completed.join(" → "));
    println!("  processed:  {}", result.processed);
    println!("  successful: {}", result.successful);
    println!("  failed:     {}", result.failed);
    println!("  success:    {:.1}%", result.success_rate() * 100.0);
    if !result.errors.is_empty() {
        println!("  errors:     {}", result.errors.len());
        for e in result.errors.iter().take(5) {
            println!("    - {e}");
        }
    }
}

async fn show_metrics(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let summary = metrics::read_summary(path).await?;
    let totals = &summary.summary;

    println!("Run {} ({} → {})", summary.run_id, summary.start_time, summary.end_time);
    println!(
        "  processed {}, successful {}, failed {}",
        totals.total_processed, totals.successful, totals.failed
    );
    if !totals.categories.is_empty() {
        println!("  categories:");
        for (name, count) in &totals.categories {
            println!("    {name:<36} {count}");
        }
    }
    if !totals.actions.is_empty() {
        println!("  actions:");
        for (name, count) in &totals.actions {
            println!("    {name:<36} {count}");
        }
    }
    if !summary.errors.is_empty() {
        println!("  recent errors:");
        for e in &summary.errors {
            println!("    - {e}");
        }
    }
    Ok(())
}
