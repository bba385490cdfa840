use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use report_resolver::cache::{ResultCache, SqliteKvStore};
use report_resolver::chart::FsArtifactStore;
use report_resolver::connector::sqlite::SqliteConnectionProvider;
use report_resolver::llm::OpenAiClient;
use report_resolver::period::DateOverrides;
use report_resolver::sql::LlmSqlGenerator;
use report_resolver::template::FsTemplateSource;
use report_resolver::{Components, Orchestrator, ResolverConfig, RunOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "report-resolver")]
#[command(about = "Resolve report template placeholders against a SQL data source")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve every placeholder of a template and print the assembled text
    Resolve {
        /// Template file
        template: PathBuf,

        /// SQLite database backing the report
        #[arg(short, long)]
        database: PathBuf,

        /// Data source id used for cache keys (default: database file stem)
        #[arg(long)]
        source: Option<String>,

        /// Schedule expression, e.g. "0 9 * * 1" or "monthly"
        #[arg(long)]
        schedule: Option<String>,

        /// Reference instant (RFC 3339)
        #[arg(long)]
        reference: Option<DateTime<Utc>>,

        /// Explicit start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Explicit end date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Result cache database
        #[arg(long, default_value = ".resolver/cache.db")]
        cache_db: PathBuf,

        /// Directory receiving chart and table artifacts
        #[arg(long, default_value = ".resolver/artifacts")]
        artifact_dir: PathBuf,

        /// Also write the JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// OpenAI API key (or set OPENAI_API_KEY env var)
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Classify placeholders and report which need reanalysis
    Scan {
        template: PathBuf,

        #[arg(short, long)]
        database: PathBuf,

        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value = ".resolver/cache.db")]
        cache_db: PathBuf,
    },
    /// Print the time window a schedule resolves to
    Period {
        #[arg(long)]
        schedule: Option<String>,

        #[arg(long)]
        reference: Option<DateTime<Utc>>,

        #[arg(long)]
        start: Option<NaiveDate>,

        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Drop old cache versions of a placeholder
    Prune {
        #[arg(long)]
        placeholder: String,

        /// Versions kept per data source (default: RESOLVER_KEEP_VERSIONS)
        #[arg(long)]
        keep: Option<usize>,

        #[arg(long, default_value = ".resolver/cache.db")]
        cache_db: PathBuf,
    },
    /// Expire every cached version of a placeholder
    Invalidate {
        #[arg(long)]
        placeholder: String,

        #[arg(long)]
        source: String,

        #[arg(long, default_value = ".resolver/cache.db")]
        cache_db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = ResolverConfig::from_env().map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    match args.command {
        Commands::Resolve {
            template,
            database,
            source,
            schedule,
            reference,
            start,
            end,
            cache_db,
            artifact_dir,
            report,
            api_key,
        } => {
            let source = source_id(source, &database);
            let orchestrator = build(&config, &database, &source, &cache_db, &artifact_dir, api_key)?;
            let options = RunOptions {
                data_source_id: source,
                schedule,
                reference,
                overrides: DateOverrides::new(start, end),
            };
            resolve(&orchestrator, &template, &options, report.as_deref()).await
        }
        Commands::Scan { template, database, source, cache_db } => {
            let source = source_id(source, &database);
            let orchestrator = build(&config, &database, &source, &cache_db, Path::new(".resolver/artifacts"), None)?;
            let text = load_template(&template).await?;
            let scan = orchestrator.scan(&text, &source).await;
            for warning in &scan.warnings {
                println!("warning: {}", warning);
            }
            for placeholder in &scan.placeholders {
                println!(
                    "{:<40} {:<12} {}",
                    placeholder.spec.id,
                    placeholder.spec.kind,
                    serde_json::to_string(&placeholder.status)?
                );
            }
            Ok(())
        }
        Commands::Period { schedule, reference, start, end } => {
            let resolver = report_resolver::period::PeriodResolver::default();
            let window = resolver.resolve(schedule.as_deref(), reference, &DateOverrides::new(start, end));
            println!("{}", window);
            Ok(())
        }
        Commands::Prune { placeholder, keep, cache_db } => {
            let cache = open_cache(&cache_db)?;
            let removed = cache
                .prune(&placeholder, keep.unwrap_or(config.keep_versions))
                .await
                .map_err(|e| anyhow!("Prune failed: {}", e))?;
            println!("Removed {} versions of '{}'", removed, placeholder);
            Ok(())
        }
        Commands::Invalidate { placeholder, source, cache_db } => {
            let cache = open_cache(&cache_db)?;
            let expired = cache
                .mark_stale(&placeholder, &source)
                .await
                .map_err(|e| anyhow!("Invalidate failed: {}", e))?;
            println!("Expired {} versions of '{}' for {}", expired, placeholder, source);
            Ok(())
        }
    }
}

fn source_id(source: Option<String>, database: &Path) -> String {
    source.unwrap_or_else(|| {
        database
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string())
    })
}

fn open_cache(path: &Path) -> Result<Arc<ResultCache>> {
    let store = SqliteKvStore::open(path).map_err(|e| anyhow!("Failed to open cache {}: {}", path.display(), e))?;
    Ok(Arc::new(ResultCache::new(Arc::new(store))))
}

fn build(
    config: &ResolverConfig,
    database: &Path,
    source: &str,
    cache_db: &Path,
    artifact_dir: &Path,
    api_key: Option<String>,
) -> Result<Orchestrator> {
    let api_key = api_key
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "dummy-api-key".to_string());
    let llm = OpenAiClient::new(
        api_key,
        std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4".to_string()),
        std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
    )
    .with_backoff(config.llm_max_retries, Duration::from_millis(config.llm_backoff_base_ms));

    let generator = LlmSqlGenerator::new(Arc::new(llm), config.llm_timeout(), config.max_tool_rounds);
    let connections = SqliteConnectionProvider::new().register(source, database);
    let components = Components::with_defaults(
        Arc::new(connections),
        Arc::new(generator),
        open_cache(cache_db)?,
        Arc::new(FsArtifactStore::new(artifact_dir)),
        config,
    );
    Ok(Orchestrator::new(components, config.clone()))
}

async fn load_template(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read template {}", path.display()))
}

async fn resolve(orchestrator: &Orchestrator, template: &Path, options: &RunOptions, report: Option<&Path>) -> Result<()> {
    let dir = template.parent().unwrap_or_else(|| Path::new("."));
    let name = template
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Template path has no file name: {}", template.display()))?;
    let source = FsTemplateSource::new(dir);

    let run = orchestrator
        .run_template(&source, &name, options)
        .await
        .map_err(|e| anyhow!("Resolution failed: {}", e))?;

    info!("Window: {}", run.window);
    for outcome in &run.outcomes {
        info!("{:<40} {}", outcome.id, outcome.status);
    }
    for warning in &run.warnings {
        info!("warning: {}", warning);
    }

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&run)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }

    println!("{}", run.text);
    Ok(())
}
