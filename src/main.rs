use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use catscout::agent::{ExtractionAgent, RunRequest, RunStage};
use catscout::browser::chromium::ChromiumDriver;
use catscout::config::Config;
use catscout::error::Error;
use catscout::llm::build_model;
use catscout::store::PgCategoryStore;

#[derive(Parser, Debug)]
#[command(
    name = "catscout",
    version,
    about = "Discover an e-commerce site's category taxonomy"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the full category tree for a retailer
    Extract {
        /// Homepage URL of the retailer
        #[arg(long)]
        url: String,

        /// Retailer id in the categories schema
        #[arg(long)]
        retailer_id: i32,

        /// Run the browser headless (the default)
        #[arg(long, overrides_with = "no_headless")]
        headless: bool,

        /// Run the browser with a visible window
        #[arg(long)]
        no_headless: bool,

        /// Ignore stored blueprints and run the full analysis
        #[arg(long)]
        force_refresh: bool,

        /// Execute this blueprint, falling back to analysis on staleness
        #[arg(long)]
        blueprint: Option<PathBuf>,

        /// Generate strategy and blueprint without persisting categories
        #[arg(long)]
        blueprint_only: bool,

        /// Override the configured traversal depth bound
        #[arg(long)]
        max_depth: Option<u32>,

        /// Override the configured category count bound
        #[arg(long)]
        max_categories: Option<usize>,
    },
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.to_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.log.file {
        Some(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => builder.with_writer(Arc::new(file)).with_ansi(false).init(),
                Err(e) => {
                    eprintln!("warning: cannot open log file {path}: {e}");
                    builder.init();
                }
            }
        }
        None => builder.init(),
    }
}

/// Red failure panel: taxonomy kind, message, likely cause. The full
/// trace lives in the log file.
fn print_failure(error: &Error) {
    let red = "\x1b[31m";
    let bold = "\x1b[1m";
    let reset = "\x1b[0m";
    eprintln!("{red}┌──────────────────────────────────────────────┐{reset}");
    eprintln!("{red}│{reset} {bold}extraction failed{reset} ({})", error.kind());
    eprintln!("{red}│{reset} {error}");
    eprintln!("{red}│{reset} hint: {}", error.hint());
    eprintln!("{red}└──────────────────────────────────────────────┘{reset}");
}

async fn run_extract(
    config: Config,
    request: RunRequest,
    headless: bool,
) -> Result<ExitCode, Error> {
    let mut config = config;
    config.browser.headless = headless;

    let model = build_model(&config.llm)?;
    let store = Arc::new(PgCategoryStore::connect(&config.store).await?);
    let driver = Arc::new(ChromiumDriver::launch(&config.browser).await?);

    let agent = ExtractionAgent::new(config, driver, store, model);
    let cancel = agent.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, finishing in-flight work (5s grace)...");
            cancel.cancel();
            // Second interrupt, or grace expiry, hard-exits.
            let again = tokio::signal::ctrl_c();
            let grace = tokio::time::sleep(Duration::from_secs(5));
            tokio::select! {
                _ = again => std::process::exit(130),
                _ = grace => std::process::exit(130),
            }
        }
    });

    let outcome = agent.run(request).await;

    match outcome.state.stage {
        RunStage::Completed => {
            let state = &outcome.state;
            println!(
                "discovered {} categories across {} depth levels",
                state.categories.len(),
                state.by_depth.len()
            );
            for (depth, count) in &state.by_depth {
                println!("  depth {depth}: {count}");
            }
            if let Some(persist) = &state.persist {
                println!(
                    "store: {} saved, {} updated, {} errors",
                    persist.saved, persist.updated, persist.errors
                );
            }
            if let Some(path) = &state.blueprint_path {
                println!("blueprint: {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        RunStage::Cancelled => Ok(ExitCode::from(130)),
        _ => {
            if let Some(error) = &outcome.error {
                print_failure(error);
            }
            Ok(ExitCode::from(1))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };
    init_logging(&config);

    match cli.command {
        Command::Extract {
            url,
            retailer_id,
            headless: _,
            no_headless,
            force_refresh,
            blueprint,
            blueprint_only,
            max_depth,
            max_categories,
        } => {
            let mut request = RunRequest::new(url, retailer_id);
            request.force_refresh = force_refresh;
            request.blueprint_path = blueprint;
            request.blueprint_only = blueprint_only;
            request.max_depth = max_depth;
            request.max_categories = max_categories;

            match run_extract(config, request, !no_headless).await {
                Ok(code) => code,
                Err(e) => {
                    print_failure(&e);
                    match e {
                        Error::Config(_) => ExitCode::from(2),
                        _ => ExitCode::from(1),
                    }
                }
            }
        }
    }
}
