//! quizlens - resolve on-screen questions against a local question bank
//!
//! Captures a screen region, reads it with Tesseract and looks the text up
//! in the configured CSV/JSON question sources.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use quizlens::app::{AnswerSink, ConsoleSink, QuizLensApp};
use quizlens::bank::{self, LoadReport};
use quizlens::capture::RawImage;
use quizlens::config::{self, AppConfig};
use quizlens::hotkey::{HotkeyAction, HotkeyManager};
use quizlens::pipeline::Pipeline;
use quizlens::shared::{AppEvent, IndexHandle};
use quizlens::storage;
use quizlens::vision::TesseractBackend;

/// quizlens - screen question lookup
#[derive(Parser, Debug)]
#[command(name = "quizlens", version)]
#[command(about = "Reads a question from the screen and looks up its answer")]
struct Args {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for the trigger hotkey (default)
    Run,
    /// Read commands from stdin instead of hotkeys
    Manual,
    /// Capture and resolve once
    Once,
    /// Resolve the question in an image file
    Image { path: PathBuf },
    /// Look up question text directly
    Query { text: String },
    /// Check the OCR engine, capture backends and question bank
    Check,
    /// Write the default config file
    InitConfig {
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::InitConfig { path, force }) = &args.command {
        return init_config(path.clone(), *force);
    }

    let (config, config_path) = load_or_default_config(args.config.as_deref())?;
    init_logging(args.log_level.as_deref(), &config.logging.level)?;

    match &config_path {
        Some(path) => info!("Loaded configuration from {:?}", path),
        None => info!("Using default configuration"),
    }

    // Relative bank paths resolve against the config file's directory
    let base_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let loaded = bank::load(&config.bank.sources, base_dir.as_deref());
    if config.bank.sources.is_empty() {
        warn!("No question sources configured; every run will be unresolved");
    }
    let report = loaded.report;
    let index = IndexHandle::new(loaded.index);
    let pipeline = Pipeline::from_config(&config, index);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_hotkeys(pipeline, &config, base_dir.as_deref()),
        Command::Manual => run_manual(pipeline, &config, base_dir.as_deref()),
        Command::Once => {
            let mut sink = ConsoleSink::default();
            let outcome = pipeline.run(|stage| sink.present(&AppEvent::Stage(stage)));
            sink.present(&AppEvent::Outcome(outcome));
            Ok(())
        }
        Command::Image { path } => {
            let image = RawImage::open(&path).with_context(|| format!("Failed to open image {:?}", path))?;
            let outcome = pipeline.run_on_image(image, |_| {});
            ConsoleSink::default().present(&AppEvent::Outcome(outcome));
            Ok(())
        }
        Command::Query { text } => {
            let outcome = pipeline.resolve_text(&text);
            ConsoleSink::default().present(&AppEvent::Outcome(outcome));
            Ok(())
        }
        Command::Check => check(&pipeline, &config, &report),
        Command::InitConfig { .. } => Ok(()),
    }
}

fn init_logging(cli_level: Option<&str>, config_level: &str) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(value) if !value.is_empty() => EnvFilter::new(value),
        _ => EnvFilter::try_new(cli_level.unwrap_or(config_level))
            .with_context(|| format!("Invalid log level {:?}", cli_level.unwrap_or(config_level)))?,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// `--config`, else the platform config file if present, else defaults
fn load_or_default_config(explicit: Option<&Path>) -> Result<(AppConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = config::load_config(path)?;
        return Ok((config, Some(path.to_path_buf())));
    }

    if let Ok(path) = storage::default_config_path() {
        if path.exists() {
            let config = config::load_config(&path)?;
            return Ok((config, Some(path)));
        }
    }

    Ok((AppConfig::default(), None))
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => storage::default_config_path()?,
    };
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }
    config::save_config(&AppConfig::default(), &path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn run_hotkeys(pipeline: Pipeline, config: &AppConfig, base_dir: Option<&Path>) -> Result<()> {
    let mut hotkeys = HotkeyManager::new(&config.hotkey)
        .context("Global hotkeys unavailable, try the `manual` command")?;
    let app = QuizLensApp::start(pipeline, Box::new(ConsoleSink::default()), None)?;

    let hint = |key: &Option<String>, what: &str| {
        key.as_deref()
            .map(|k| format!(", {} to {}", k, what))
            .unwrap_or_default()
    };
    info!(
        "Press {} to read the question{}{}{}",
        config.hotkey.trigger,
        hint(&config.hotkey.reload, "reload the bank"),
        hint(&config.hotkey.stats, "show statistics"),
        hint(&config.hotkey.exit, "quit"),
    );

    loop {
        match hotkeys.poll(Duration::from_millis(100)) {
            Some(HotkeyAction::Trigger) => {
                app.trigger();
            }
            Some(HotkeyAction::Reload) => {
                let report = app.reload_bank(&config.bank.sources, base_dir);
                info!(
                    "Reloaded {} of {} sources, {} questions",
                    report.total_sources - report.failures.len(),
                    report.total_sources,
                    app.index().snapshot().len()
                );
            }
            Some(HotkeyAction::Stats) => {
                let stats = app.stats();
                println!("{}", stats);
                if let Some(e) = &stats.last_error {
                    println!("Last error: {}", e);
                }
            }
            Some(HotkeyAction::Exit) => break,
            None => {}
        }
    }

    let stats = app.shutdown();
    info!("Exit statistics: {}", stats);
    Ok(())
}

const MANUAL_HELP: &str = "\
Commands:
  answer  capture and resolve the question
  status  show runtime statistics
  config  show the active configuration
  reload  reload the question bank
  help    show this help
  quit    exit";

fn run_manual(pipeline: Pipeline, config: &AppConfig, base_dir: Option<&Path>) -> Result<()> {
    let capture_region = pipeline.region();
    let app = QuizLensApp::start(pipeline, Box::new(ConsoleSink::default()), None)?;

    println!("{}", MANUAL_HELP);
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;

        match line.trim().to_lowercase().as_str() {
            "" => {}
            "answer" | "a" => {
                app.trigger();
            }
            "status" | "s" => {
                let stats = app.stats();
                println!("Capture region: {}", capture_region);
                println!("Questions loaded: {}", app.index().snapshot().len());
                println!("{}", stats);
                if let Some(e) = &stats.last_error {
                    println!("Last error: {}", e);
                }
            }
            "config" | "c" => match toml::to_string_pretty(config) {
                Ok(text) => println!("{}", text),
                Err(e) => error!("Cannot render configuration: {}", e),
            },
            "reload" | "r" => {
                let report = app.reload_bank(&config.bank.sources, base_dir);
                println!(
                    "Reloaded {} of {} sources, {} questions",
                    report.total_sources - report.failures.len(),
                    report.total_sources,
                    app.index().snapshot().len()
                );
            }
            "help" | "h" | "?" => println!("{}", MANUAL_HELP),
            "quit" | "q" | "exit" => break,
            other => println!("Unknown command '{}', type help", other),
        }
    }

    let stats = app.shutdown();
    info!("Exit statistics: {}", stats);
    Ok(())
}

fn check(pipeline: &Pipeline, config: &AppConfig, report: &LoadReport) -> Result<()> {
    let tesseract = TesseractBackend::new(
        &config.ocr.tesseract_cmd,
        &config.ocr.language,
        Duration::from_millis(config.ocr.timeout_ms),
    );
    match tesseract.health() {
        Ok(health) => {
            println!("OCR engine: {}", health.version);
            println!("  languages: {}", health.languages.join(", "));
            if !health.is_ready() {
                println!("  missing: {}", health.missing_languages.join(", "));
            }
        }
        Err(e) => println!("OCR engine: unavailable ({})", e),
    }

    println!("Capture backends:");
    if pipeline.capture().backends().is_empty() {
        println!("  none available on this platform");
    }
    for backend in pipeline.capture().backends() {
        match backend.virtual_bounds() {
            Ok(bounds) => println!("  {} (screen {})", backend.name(), bounds),
            Err(e) => println!("  {} (unavailable: {})", backend.name(), e),
        }
    }

    let index = pipeline.index().snapshot();
    println!("Question bank: {} questions", index.len());
    for stats in index.stats() {
        println!(
            "  {} (priority {}): {} questions, {} empty rows, {} invalid rows",
            stats.id, stats.priority, stats.entries, stats.skipped_empty, stats.skipped_invalid
        );
    }
    for (id, reason) in &report.failures {
        println!("  {} skipped: {}", id, reason);
    }

    Ok(())
}
