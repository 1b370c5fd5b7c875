use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, Write};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use unitmap::cli::{Cli, Commands, OutputFormat};
use unitmap::compile::PythonCompiler;
use unitmap::config::Settings;
use unitmap::dump::{collect_sources, dump, render_json, render_text};
use unitmap::extract::RangeExtractor;
use unitmap::service::{
    DiagnosticLog, FrameSink, LineSource, QueryService, StreamSink, StreamSource, TeeSink,
    TeeSource,
};
use unitmap::signature::Classifier;
use unitmap::wire::encode_status;

fn main() -> Result<()> {
    init_tracing()?;
    let cli = parse_cli();

    let compiler = PythonCompiler::new();
    let classifier = match calibrate(&cli, &compiler) {
        Ok(classifier) => classifier,
        Err(err) => {
            // the host blocks on the handshake status until it gets one
            if matches!(cli.command, Commands::Serve { no_handshake: false, .. }) {
                write_degraded_status()?;
            }
            return Err(err);
        }
    };

    match cli.command {
        Commands::Serve {
            out_log,
            in_log,
            no_handshake,
        } => serve(
            compiler,
            classifier,
            out_log.as_deref(),
            in_log.as_deref(),
            !no_handshake,
        )?,
        Commands::Dump { paths, format } => {
            let files = collect_sources(&paths)?;
            info!(files = files.len(), "mapping sources");
            let reports = dump(&compiler, &classifier, &files);
            let content = match format {
                OutputFormat::Json => render_json(&reports)?,
                OutputFormat::Text => render_text(&reports),
            };
            print!("{content}");
            if !content.ends_with('\n') {
                println!();
            }
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries the binary protocol
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install the tracing subscriber")?;
    Ok(())
}

fn calibrate(cli: &Cli, compiler: &PythonCompiler) -> Result<Classifier> {
    let settings = Settings::resolve(cli)?;
    Classifier::calibrate(
        compiler,
        RangeExtractor::new(settings.glue_len),
        settings.signature_len,
    )
    .context("Failed to calibrate the class signature")
}

fn write_degraded_status() -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout
        .write_all(&encode_status(false))
        .and_then(|()| stdout.flush())
        .context("Failed to write the handshake status")
}

fn serve(
    compiler: PythonCompiler,
    classifier: Classifier,
    out_log: Option<&Path>,
    in_log: Option<&Path>,
    handshake: bool,
) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();

    let mut source: Box<dyn LineSource> = Box::new(StreamSource::new(stdin.lock()));
    let mut sink: Box<dyn FrameSink> = Box::new(StreamSink::new(stdout.lock()));
    let mut report = None;

    if let Some(path) = out_log {
        let log = DiagnosticLog::create(path)?;
        sink = Box::new(TeeSink::new(sink, log.clone()));
        report = Some(log);
    }
    if let Some(path) = in_log {
        source = Box::new(TeeSource::new(source, DiagnosticLog::create(path)?));
    }

    let mut service = QueryService::new(compiler, classifier, source, sink);
    if let Some(log) = report {
        service = service.with_failure_report(log);
    }
    service.run(handshake)
}

fn parse_cli() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    Cli::parse_from(rewrite_args_for_implicit_serve(args))
}

/// `unitmap [<out-log> [<in-log>]]` is how profilers launch the service; it
/// becomes `unitmap serve ...`. Global options are accepted after the
/// subcommand, so `serve` always goes right after the program name.
fn rewrite_args_for_implicit_serve(mut args: Vec<String>) -> Vec<String> {
    let subcommands = ["serve", "dump", "help"];

    let mut idx = 1usize;
    while idx < args.len() {
        let a = args[idx].as_str();
        if a == "--" {
            idx += 1;
            break;
        }

        if a == "--glue-len" || a == "--signature-len" {
            idx += 2;
            continue;
        }

        if a == "-h" || a == "--help" || a == "-V" || a == "--version" {
            return args;
        }

        if a.starts_with('-') {
            idx += 1;
            continue;
        }

        break;
    }

    let explicit = args
        .get(idx)
        .is_some_and(|token| subcommands.contains(&token.as_str()));
    if !explicit {
        args.insert(1.min(args.len()), "serve".to_string());
    }

    args
}
