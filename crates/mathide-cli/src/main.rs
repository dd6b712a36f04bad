//! `mathide` diagnostic binary
//!
//! - `mathide decode [FILE] [--kind KIND]` runs the response decoder over
//!   model text and prints the typed record, or the failure with the reason
//!   each decode stage gave up
//! - `mathide history FILE` loads an exported session and prints its summary
//!
//! Output is JSON on stdout. Logs go to stderr and follow `RUST_LOG`.

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use mathide_parse::records::{
    read_generation, read_record, ApplyResponse, BranchingResponse, CheckResponse,
    ProgressResponse, ResponseRecord, VerificationResponse,
};
use mathide_parse::{decode, locate_payload, DecodeError, PayloadShape};
use mathide_session::StepHistory;
use serde_json::{json, Value};
use std::io::Read;
use std::path::Path;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

const KINDS: [&str; 7] = [
    "generation",
    "apply",
    "check",
    "progress",
    "verify",
    "branching",
    "raw",
];

fn cli() -> Command {
    Command::new("mathide")
        .version(env!("CARGO_PKG_VERSION"))
        .about("MathIDE diagnostics")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log decoder stages when RUST_LOG is unset"),
        )
        .subcommand(
            Command::new("decode")
                .about("Decode model output from a file or stdin")
                .arg(Arg::new("file").help("File holding raw model text (stdin when omitted)"))
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .default_value("raw")
                        .value_parser(KINDS)
                        .help("Record type to decode into"),
                ),
        )
        .subcommand(
            Command::new("history")
                .about("Summarize an exported session")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .help("Exported session JSON"),
                ),
        )
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("verbose"));

    match run(&matches) {
        Ok(report) => {
            println!("{}", pretty(&report.body));
            std::process::exit(if report.success { 0 } else { 1 });
        }
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Command output and whether it counts as success
#[derive(Debug)]
struct Report {
    success: bool,
    body: Value,
}

fn run(matches: &ArgMatches) -> anyhow::Result<Report> {
    match matches.subcommand() {
        Some(("decode", args)) => {
            let text = match args.get_one::<String>("file") {
                Some(path) => read_file(Path::new(path))?,
                None => {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .context("reading model text from stdin")?;
                    text
                }
            };
            let kind = args
                .get_one::<String>("kind")
                .map_or("raw", String::as_str);
            debug!(kind, bytes = text.len(), "decoding model text");
            Ok(decode_report(&text, kind))
        }
        Some(("history", args)) => {
            let path = args
                .get_one::<String>("file")
                .context("history file is required")?;
            let text = read_file(Path::new(path))?;
            history_report(&text).map(|body| Report {
                success: true,
                body,
            })
        }
        _ => anyhow::bail!("unknown command"),
    }
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn decode_report(text: &str, kind: &str) -> Report {
    let decoded = match kind {
        "generation" => read_generation(text).and_then(|items| to_value(&items)),
        "apply" => typed::<ApplyResponse>(text),
        "check" => typed::<CheckResponse>(text),
        "progress" => typed::<ProgressResponse>(text),
        "verify" => typed::<VerificationResponse>(text),
        "branching" => typed::<BranchingResponse>(text),
        _ => raw(text),
    };

    match decoded {
        Ok(body) => Report {
            success: true,
            body,
        },
        Err(err) => Report {
            success: false,
            body: failure(&err),
        },
    }
}

fn typed<R: ResponseRecord + serde::Serialize>(text: &str) -> Result<Value, DecodeError> {
    read_record::<R>(text).and_then(|record| to_value(&record))
}

fn raw(text: &str) -> Result<Value, DecodeError> {
    let payload = locate_payload(text, PayloadShape::Any)?;
    let decoded = decode(payload)?;
    Ok(json!({
        "stage": decoded.stage.label(),
        "repaired": decoded.was_repaired(),
        "value": decoded.value,
    }))
}

fn to_value<T: serde::Serialize>(record: &T) -> Result<Value, DecodeError> {
    serde_json::to_value(record).map_err(|err| DecodeError::InvalidShape {
        record: "output",
        message: err.to_string(),
    })
}

fn failure(err: &DecodeError) -> Value {
    let mut body = json!({ "error": err.to_string() });
    match err {
        DecodeError::ParseFailure { attempts, .. } => {
            body["stages"] = attempts
                .iter()
                .map(|attempt| json!({"stage": attempt.stage, "message": attempt.message}))
                .collect();
        }
        DecodeError::MissingField { fields, .. } => {
            body["missing"] = json!(fields);
        }
        _ => {}
    }
    body
}

fn history_report(text: &str) -> anyhow::Result<Value> {
    let data: Value = serde_json::from_str(text).context("exported session is not JSON")?;
    let history = StepHistory::import(&data).context("exported session rejected")?;
    Ok(serde_json::to_value(history.summary())?)
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
