//! Heavy pool worker process.
//!
//! Reads conversion requests from stdin and writes replies to stdout until
//! stdin is closed. Logs go to stderr, since stdout carries the protocol.

use clap::{Parser, ValueEnum};
use docdispatch::process::serve;
use docdispatch::{Converter, DiagnosticConverter, PlainTextConverter};
use std::io::{self, BufReader, BufWriter};
use std::process::ExitCode;

/// Converter hosted by the worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ConverterKind {
    /// UTF-8 text formats
    Text,
    /// Text converter with crash/panic/hang/sleep filename directives
    Diagnostic,
}

#[derive(Debug, Parser)]
#[command(name = "docdispatch-worker", version, about = "docdispatch heavy pool worker")]
struct Args {
    /// Converter to run
    #[arg(long, value_enum, default_value_t = ConverterKind::Text, env = "DOCDISPATCH_CONVERTER")]
    converter: ConverterKind,

    /// Log filter, e.g. `info` or `docdispatch=debug`
    #[arg(long, default_value = "warn", env = "DOCDISPATCH_LOG")]
    log: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .parse_filters(&args.log)
        .target(env_logger::Target::Stderr)
        .init();

    let converter: Box<dyn Converter> = match args.converter {
        ConverterKind::Text => Box::new(PlainTextConverter::new()),
        ConverterKind::Diagnostic => Box::new(DiagnosticConverter::new(PlainTextConverter::new())),
    };
    log::info!(
        "worker {} ready with {}",
        std::process::id(),
        converter.name()
    );

    let stdin = io::stdin();
    let stdout = io::stdout();
    let reader = BufReader::new(stdin.lock());
    let writer = BufWriter::new(stdout.lock());

    match serve(converter.as_ref(), reader, writer) {
        Ok(served) => {
            log::info!("worker {} exiting after {} jobs", std::process::id(), served);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("worker {} protocol error: {}", std::process::id(), e);
            ExitCode::FAILURE
        }
    }
}
