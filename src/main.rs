//! CLI for rtfraptor: open documents in Office under a debugger and report
//! the OLE objects they load.

#![cfg(feature = "cli")]

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indexmap::IndexMap;
use rtfraptor::extractor::DEFAULT_MAX_OBJECT_SIZE;
use rtfraptor::{
    debugger, Classifier, ClsidTable, Error, Session, SessionConfig, SessionReport, StopReason,
    Verdict,
};
use walkdir::WalkDir;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_LAUNCH: i32 = 2;
const EXIT_TIMEOUT: i32 = 3;

#[derive(Parser)]
#[command(name = "rtfraptor", version)]
#[command(about = "Run documents in Office under a debugger and extract the OLE objects they load", long_about = None)]
struct Args {
    /// Office application to run the document in (must be 32-bit)
    executable: PathBuf,

    /// Document to open (use -d/--directory to analyse a whole directory)
    path: Option<PathBuf>,

    /// Analyse every document in a directory, one session at a time
    #[arg(short = 'd', long = "directory", value_name = "DIR")]
    directory: Option<PathBuf>,

    /// When analysing a directory, recurse into subdirectories
    #[arg(short, long)]
    recursive: bool,

    /// Seconds to let the application run per document
    #[arg(short, long, value_name = "SECS", default_value_t = 10)]
    timeout: u64,

    /// Directory to save recovered objects to, named by SHA-256
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output: PathBuf,

    /// Do not save recovered objects
    #[arg(long)]
    no_save: bool,

    /// Abandon objects declaring more than this many bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_OBJECT_SIZE)]
    max_size: u32,

    /// JSON object of extra class ids to flag: {"<CLSID>": "<description>"}
    #[arg(long, value_name = "JSON")]
    clsid_db: Option<PathBuf>,

    /// Output JSON per document (one line per document unless --pretty)
    #[arg(long)]
    json: bool,

    /// Pretty-print JSON (use with --json)
    #[arg(long)]
    pretty: bool,

    /// Quiet: only print documents that loaded objects
    #[arg(short, long)]
    quiet: bool,

    /// Log hook installation and every correlated call
    #[arg(short, long)]
    verbose: bool,
}

/// How one document ended, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
    Exited,
    TimedOut,
    LaunchFailed,
    Failed,
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Outcome::Exited => EXIT_OK,
            Outcome::TimedOut => EXIT_TIMEOUT,
            Outcome::LaunchFailed => EXIT_LAUNCH,
            Outcome::Failed => EXIT_ERROR,
        }
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else if args.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("rtfraptor", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let code = match run(&args) {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            eprintln!("error: {:#}", err);
            EXIT_ERROR
        }
    };
    process::exit(code);
}

fn run(args: &Args) -> anyhow::Result<Outcome> {
    let classifier = load_classifier(args.clsid_db.as_deref())?;

    let path = match (&args.directory, &args.path) {
        (Some(dir), _) => dir,
        (None, Some(path)) => path,
        (None, None) => {
            bail!("Missing document: give a file as argument or use -d/--directory <DIR>")
        }
    };
    if !path.exists() {
        bail!("Not found: {}", path.display());
    }

    if path.is_file() {
        if args.directory.is_some() {
            bail!("--directory expects a directory, not a file: {}", path.display());
        }
        return analyze_file(path, args, &classifier);
    }

    if path.is_dir() {
        if !args.quiet {
            eprintln!(
                "Analysing directory: {} {}",
                path.display(),
                if args.recursive { "(recursive)" } else { "" }
            );
        }
        return analyze_dir(path, args, &classifier);
    }

    bail!("Not a file or directory: {}", path.display())
}

fn load_classifier(db: Option<&Path>) -> anyhow::Result<Classifier> {
    let mut table = ClsidTable::builtin();
    if let Some(db) = db {
        let json = fs::read_to_string(db)
            .with_context(|| format!("could not read class id database {}", db.display()))?;
        let added = table
            .extend_from_json(&json)
            .with_context(|| format!("could not load class id database {}", db.display()))?;
        log::debug!("Loaded {} class ids from {}", added, db.display());
    }
    Ok(Classifier::new(table))
}

fn session_config(document: &Path, args: &Args) -> SessionConfig {
    SessionConfig {
        timeout: Duration::from_secs(args.timeout),
        output_dir: (!args.no_save).then(|| args.output.clone()),
        max_object_size: args.max_size,
        ..SessionConfig::new(&args.executable, document)
    }
}

fn analyze_file(path: &Path, args: &Args, classifier: &Classifier) -> anyhow::Result<Outcome> {
    let adapter = debugger::native()?;
    let config = session_config(path, args);
    let result = Session::new(adapter, config)
        .with_classifier(classifier.clone())
        .run();
    match result {
        Ok(report) => {
            print_report(&report, args)?;
            Ok(match report.stop_reason {
                StopReason::TargetExited => Outcome::Exited,
                StopReason::DeadlineExpired => Outcome::TimedOut,
            })
        }
        Err(err @ Error::Launch { .. }) => {
            eprintln!("{}: {}", path.display(), err);
            Ok(Outcome::LaunchFailed)
        }
        Err(err) => Err(err).with_context(|| format!("analysis of {} failed", path.display())),
    }
}

fn analyze_dir(dir: &Path, args: &Args, classifier: &Classifier) -> anyhow::Result<Outcome> {
    let walker = if args.recursive {
        WalkDir::new(dir).into_iter()
    } else {
        WalkDir::new(dir).max_depth(1).into_iter()
    };

    let mut worst = Outcome::Exited;
    let mut total = 0u64;
    let mut malicious = 0u64;
    let mut suspicious = 0u64;

    for entry in walker.filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')) {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if is_saved_object(path) {
            continue;
        }
        total += 1;
        let adapter = debugger::native()?;
        let result = Session::new(adapter, session_config(path, args))
            .with_classifier(classifier.clone())
            .run();
        let outcome = match result {
            Ok(report) => {
                match report.verdict {
                    Verdict::Malicious => malicious += 1,
                    Verdict::Suspicious => suspicious += 1,
                    Verdict::Benign => {}
                }
                print_report(&report, args)?;
                match report.stop_reason {
                    StopReason::TargetExited => Outcome::Exited,
                    StopReason::DeadlineExpired => Outcome::TimedOut,
                }
            }
            Err(err @ Error::Launch { .. }) => {
                eprintln!("{}: {}", path.display(), err);
                Outcome::LaunchFailed
            }
            Err(err) => {
                eprintln!("{}: {}", path.display(), err);
                Outcome::Failed
            }
        };
        worst = worst.max(outcome);
    }

    if !args.quiet {
        eprintln!(
            "Analysed {} documents, {} malicious, {} suspicious",
            total, malicious, suspicious
        );
    }
    Ok(worst)
}

/// Objects from earlier runs are saved under their bare digest.
fn is_saved_object(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.len() == 64 && n.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Report fields in a fixed order for `--json`.
fn report_json(report: &SessionReport, path: String) -> serde_json::Result<IndexMap<String, serde_json::Value>> {
    let mut out = IndexMap::<String, serde_json::Value>::new();
    out.insert("path".to_string(), serde_json::Value::String(path));
    out.insert("verdict".to_string(), serde_json::Value::String(format!("{:?}", report.verdict)));
    out.insert("stop_reason".to_string(), serde_json::to_value(report.stop_reason)?);
    let objects = report
        .objects
        .iter()
        .map(|o| {
            let mut obj = IndexMap::<String, serde_json::Value>::new();
            obj.insert("sha256".to_string(), serde_json::Value::String(o.sha256.clone()));
            obj.insert("size".to_string(), serde_json::to_value(o.size)?);
            obj.insert("clsid".to_string(), serde_json::to_value(o.class_id_string())?);
            obj.insert("description".to_string(), serde_json::to_value(&o.description)?);
            obj.insert("saved_to".to_string(), serde_json::to_value(&o.path)?);
            Ok(obj)
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    out.insert("objects".to_string(), serde_json::to_value(objects)?);
    out.insert("unresolved_hooks".to_string(), serde_json::to_value(&report.unresolved_hooks)?);
    out.insert("anomalies".to_string(), serde_json::to_value(report.anomalies)?);
    out.insert("failed_extractions".to_string(), serde_json::to_value(report.failed_extractions)?);
    Ok(out)
}

fn print_report(report: &SessionReport, args: &Args) -> anyhow::Result<()> {
    if args.quiet && report.verdict == Verdict::Benign {
        return Ok(());
    }
    let path = report.document.display().to_string();
    if args.json {
        let out = report_json(report, path)?;
        let json_str = if args.pretty {
            serde_json::to_string_pretty(&out)?
        } else {
            serde_json::to_string(&out)?
        };
        println!("{}", json_str);
        return Ok(());
    }

    let stopped = if report.timed_out() { " (timed out)" } else { "" };
    match report.verdict {
        Verdict::Malicious => println!("MALICIOUS {}{}", path, stopped),
        Verdict::Suspicious => println!("SUSPICIOUS {}{}", path, stopped),
        Verdict::Benign => {
            if !args.quiet {
                println!("OK {}{}", path, stopped);
            }
        }
    }
    for o in &report.objects {
        let clsid = o.class_id_string().unwrap_or_else(|| "-".to_string());
        let desc = o.description.as_deref().unwrap_or("not loaded");
        println!("  object: {} ({} bytes)", o.sha256, o.size);
        println!("    clsid: {} [{}]", clsid, desc);
        if let Some(ref saved) = o.path {
            println!("    saved: {}", saved.display());
        }
    }
    if !args.quiet {
        for h in &report.unresolved_hooks {
            println!("  warning: could not hook {}", h);
        }
        if report.anomalies > 0 {
            println!("  warning: {} overlapping object loads, class ids may be misattributed", report.anomalies);
        }
        if report.failed_extractions > 0 {
            println!("  warning: {} objects could not be read", report.failed_extractions);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtfraptor::debugger::SimulatedTarget;

    #[test]
    fn json_report_keeps_field_order() {
        let sim = SimulatedTarget::new().exit(0);
        let config = SessionConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            ..SessionConfig::new("WINWORD.EXE", "sample.rtf")
        };
        let report = Session::new(sim, config).run().unwrap();
        let out = report_json(&report, "sample.rtf".to_string()).unwrap();
        let json = serde_json::to_string(&out).unwrap();
        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            [
                "path",
                "verdict",
                "stop_reason",
                "objects",
                "unresolved_hooks",
                "anomalies",
                "failed_extractions"
            ]
        );
        assert!(json.starts_with(r#"{"path":"sample.rtf","verdict":"Benign""#));
    }
}
