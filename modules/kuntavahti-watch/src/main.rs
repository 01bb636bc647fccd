use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kuntavahti_common::{Config, Platform};
use kuntavahti_connectors::{Gateway, UrlValidator};
use kuntavahti_store::Store;
use kuntavahti_watch::scheduler::{cooldown_after, source_due};
use kuntavahti_watch::stages::run_discover;
use kuntavahti_watch::{Claude, Scheduler};

#[derive(Parser)]
#[command(name = "kuntavahti", about = "Municipal environmental-decision watchdog")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema.
    InitDb,
    /// Register a new source.
    AddSource {
        #[arg(long, short = 'm')]
        municipality: String,
        /// cloudnc, dynasty, tweb, or municipal_website.
        #[arg(long, short = 'p')]
        platform: String,
        #[arg(long, short = 'u')]
        base_url: String,
        /// Source configuration JSON (listing paths, selectors).
        #[arg(long)]
        config: Option<String>,
    },
    /// Run discovery once, for all enabled sources or one of them.
    RunDiscover {
        #[arg(long)]
        source: Option<i64>,
    },
    /// Run discovery and drain the whole pipeline once.
    RunPipeline,
    /// Print per-source health and the monthly LLM spend.
    Health,
    /// Run the periodic scheduler until interrupted.
    Watch,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                "kuntavahti=info".parse().expect("valid directive"),
            ),
        )
        .init();
    dotenv_load();

    let cli = Cli::parse();
    let config = Config::from_env();

    let exit_code = match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Fatal error");
            2
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli, config: Config) -> Result<i32> {
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("cannot open database at {}", config.database_url))?;

    match cli.command {
        Command::InitDb => {
            // Connecting migrates; nothing more to do.
            println!("Database ready at {}", config.database_url);
            Ok(0)
        }
        Command::AddSource {
            municipality,
            platform,
            base_url,
            config: source_config,
        } => {
            if platform.parse::<Platform>().is_err() {
                eprintln!("Unknown platform: {platform}");
                return Ok(2);
            }
            if let Some(raw) = source_config.as_deref() {
                if serde_json::from_str::<serde_json::Value>(raw).is_err() {
                    eprintln!("Source config is not valid JSON");
                    return Ok(2);
                }
            }
            let id = store
                .add_source(&municipality, &platform, &base_url, source_config.as_deref())
                .await?;
            println!("Added source {id}: {municipality} ({platform})");
            Ok(0)
        }
        Command::RunDiscover { source } => {
            let gateway = Arc::new(make_gateway(&config));
            let sources = match source {
                Some(id) => match store.get_source(id).await? {
                    Some(row) => vec![row],
                    None => {
                        eprintln!("No source with id {id}");
                        return Ok(2);
                    }
                },
                None => store.enabled_sources().await?,
            };
            let stats = run_discover(&store, gateway, sources, Utc::now()).await;
            println!("{stats}");
            Ok(if stats.sources_failed > 0 { 1 } else { 0 })
        }
        Command::RunPipeline => {
            let gateway = Arc::new(make_gateway(&config));
            let model = Arc::new(Claude::new(config.anthropic_api_key.clone()));
            let shutdown = Arc::new(AtomicBool::new(false));
            let scheduler = Scheduler::new(store.clone(), gateway, model, config, shutdown);

            let stats = scheduler.tick().await?;
            println!(
                "Pipeline drained: {} documents advanced{}",
                stats.processed,
                stats
                    .discover
                    .as_ref()
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default()
            );
            let failed = stats
                .discover
                .as_ref()
                .map(|d| d.sources_failed)
                .unwrap_or(0);
            Ok(if failed > 0 { 1 } else { 0 })
        }
        Command::Health => {
            print_health(&store, &config).await?;
            Ok(0)
        }
        Command::Watch => {
            let gateway = Arc::new(make_gateway(&config));
            let model = Arc::new(Claude::new(config.anthropic_api_key.clone()));
            let shutdown = Arc::new(AtomicBool::new(false));
            config.log_redacted();

            let flag = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    flag.store(true, Ordering::Relaxed);
                }
            });

            let scheduler = Scheduler::new(store, gateway, model, config, shutdown);
            scheduler.run().await?;
            Ok(0)
        }
    }
}

fn make_gateway(config: &Config) -> Gateway {
    Gateway::new(
        UrlValidator::new(),
        config.rate_limit_rps,
        config.user_agent(),
    )
}

async fn print_health(store: &Store, config: &Config) -> Result<()> {
    let now = Utc::now();
    let sources = store.list_sources().await?;
    if sources.is_empty() {
        println!("No sources configured.");
    } else {
        println!(
            "{:<20} {:<18} {:<10} {:<18} {}",
            "Municipality", "Platform", "Failures", "Last success", "State"
        );
        for source in &sources {
            let last_success = source
                .last_success_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            let state = if !source.enabled {
                "disabled".to_string()
            } else if !source_due(source, now) {
                let cooldown = cooldown_after(source.consecutive_failures)
                    .map(|d| d.num_minutes())
                    .unwrap_or(0);
                format!("cooldown ({cooldown} min)")
            } else if source.consecutive_failures > 0 {
                "failing".to_string()
            } else {
                "ok".to_string()
            };
            println!(
                "{:<20} {:<18} {:<10} {:<18} {}",
                source.municipality, source.platform, source.consecutive_failures, last_success, state
            );
        }
    }

    let spend = store.month_to_date_cost(now).await?;
    let paused = store.count_budget_exhausted().await?;
    println!(
        "\nLLM spend this month: {spend:.2} / {:.2} EUR{}",
        config.llm_monthly_budget_eur,
        if paused > 0 {
            format!(" — budget exhausted, {paused} documents paused")
        } else {
            String::new()
        }
    );
    Ok(())
}

/// Load `.env` from the working directory without overriding the real
/// environment.
fn dotenv_load() {
    let Ok(content) = std::fs::read_to_string(".env") else {
        return;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if std::env::var(key.trim()).is_err() {
                std::env::set_var(key.trim(), value.trim());
            }
        }
    }
}
