//! jsc-embed CLI - evaluate scripts through the embedding layer.
//!
//! Runs a file or an `--eval` string in a fresh context and prints the
//! completion value. Scripts get a global `print` that writes its arguments
//! to stdout. Without the `system-jsc` or `bun-webkit` feature the
//! in-process mock engine is used.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use jsc_embed::{
    EmbedConfig, EmbedError, EmbeddingContext, EvalOptions, NativeEngine, ScriptError, Value,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(
    name = "jsc-embed",
    version,
    about = "Evaluate JavaScript through the jsc-embed layer",
    long_about = "Evaluates a script on a dedicated engine thread.\n\n\
                  Run a file:    jsc-embed script.js\n\
                  Eval code:     jsc-embed -e '1 + 1'\n\
                  Syntax only:   jsc-embed --check script.js"
)]
struct Cli {
    /// Script file to run
    file: Option<PathBuf>,

    /// Evaluate argument as a script
    #[arg(short = 'e', long = "eval", conflicts_with = "file")]
    eval: Option<String>,

    /// Print the completion value as JSON
    #[arg(long)]
    json: bool,

    /// Only check the script for syntax errors
    #[arg(long)]
    check: bool,

    /// Report exceptions through an exception handler and keep going
    #[arg(long)]
    handler: bool,

    /// Request a garbage collection after evaluation
    #[arg(long)]
    gc: bool,

    /// Print worker statistics on exit
    #[arg(long)]
    stats: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Config file path (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => EmbedConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EmbedConfig::default(),
    };

    let (source, source_url) = match (&cli.eval, &cli.file) {
        (Some(code), _) => (code.clone(), "<eval>".to_string()),
        (None, Some(path)) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            (source, path.display().to_string())
        }
        (None, None) => {
            Cli::command().print_help()?;
            return Ok(());
        }
    };

    let ctx = EmbeddingContext::with_config(engine(), config)?;
    debug!(context = %ctx.handle(), worker = ctx.worker_name(), "Context ready");

    ctx.register_function("print", |args| {
        let line: Vec<String> = args.iter().map(Value::to_string).collect();
        println!("{}", line.join(" "));
        Ok(Value::Undefined)
    })?;

    let uncaught = Arc::new(AtomicUsize::new(0));
    if cli.handler {
        let uncaught = uncaught.clone();
        ctx.set_exception_handler(move |error| {
            eprintln!("{}", describe(&error));
            uncaught.fetch_add(1, Ordering::SeqCst);
        });
    }

    let outcome = run(&cli, &ctx, source, source_url).await;

    if cli.stats {
        let stats = ctx.stats();
        eprintln!(
            "units: {} submitted, {} completed, {} failed, {} in flight ({:.1}% ok)",
            stats.units_submitted,
            stats.units_completed,
            stats.units_failed,
            stats.units_in_flight(),
            stats.success_rate()
        );
        eprintln!("pending releases: {}", ctx.pending_releases());
    }
    ctx.shutdown();

    if let Err(err) = outcome {
        if let Some(EmbedError::Script(error)) = err.downcast_ref::<EmbedError>() {
            eprintln!("{}", describe(error));
            std::process::exit(1);
        }
        return Err(err);
    }
    if uncaught.load(Ordering::SeqCst) > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: &Cli, ctx: &EmbeddingContext, source: String, source_url: String) -> Result<()> {
    if cli.check {
        if ctx.check_syntax(&source, Some(&source_url), 1)? {
            println!("{}: syntax OK", source_url);
        }
        return Ok(());
    }

    let value = if cli.file.is_some() {
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            ctx.evaluate_with(&source, EvalOptions::new().source_url(source_url))
        })
        .await??
    } else {
        ctx.evaluate_async(source).await?
    };

    if cli.gc {
        ctx.garbage_collect()?;
    }

    print_value(&value, cli.json)
}

fn print_value(value: &Value, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&value.to_json()?)?);
    } else if !value.is_undefined() {
        println!("{}", value);
    }
    Ok(())
}

fn describe(error: &ScriptError) -> String {
    let mut text = format!("Uncaught {}", error);
    if let Some((url, line, _)) = error.location() {
        text.push_str(&format!("\n    at {}", url.unwrap_or("<anonymous>")));
        if let Some(line) = line {
            text.push_str(&format!(":{}", line));
        }
    }
    text
}

#[cfg(any(feature = "system-jsc", feature = "bun-webkit"))]
fn engine() -> Arc<dyn NativeEngine> {
    Arc::new(jsc_embed::JscEngine::new())
}

#[cfg(not(any(feature = "system-jsc", feature = "bun-webkit")))]
fn engine() -> Arc<dyn NativeEngine> {
    Arc::new(jsc_embed::MockEngine::new())
}
