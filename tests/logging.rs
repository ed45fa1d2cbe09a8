//! Log records emitted while classifying and running sessions.

use std::cell::RefCell;
use std::sync::Once;
use std::time::Duration;

use log::{Level, LevelFilter, Log, Metadata, Record};
use rtfraptor::classifier::parse_clsid;
use rtfraptor::debugger::SimulatedTarget;
use rtfraptor::{Classifier, Session, SessionConfig, TrackedObject};

thread_local! {
    static RECORDS: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// Keeps the records of the current test thread.
struct Capture;

impl Log for Capture {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        RECORDS.with(|r| r.borrow_mut().push((record.level(), record.args().to_string())));
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture;
static INIT: Once = Once::new();

/// Runs `f` and returns what it logged on this thread.
fn captured(f: impl FnOnce()) -> Vec<(Level, String)> {
    INIT.call_once(|| {
        log::set_logger(&CAPTURE).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
    RECORDS.with(|r| r.borrow_mut().clear());
    f();
    RECORDS.with(|r| r.borrow_mut().drain(..).collect())
}

fn at(records: &[(Level, String)], level: Level) -> Vec<&str> {
    records
        .iter()
        .filter(|(l, _)| *l == level)
        .map(|(_, m)| m.as_str())
        .collect()
}

#[test]
fn listed_class_id_warns_with_size_and_digest() {
    let id = parse_clsid("0002CE02-0000-0000-C000-000000000046").unwrap();
    let digest = "ab".repeat(32);
    let mut obj = TrackedObject::new(0x1000, 42, digest.clone());
    let records = captured(|| {
        Classifier::default().apply(id, Some(&mut obj));
    });

    let warnings = at(&records, Level::Warn);
    assert!(warnings.iter().any(|m| m.contains("0002CE02-0000-0000-C000-000000000046")));
    assert!(warnings.iter().any(|m| m.contains("42") && m.contains(&digest)));
}

#[test]
fn unlisted_class_id_is_informational() {
    let id = parse_clsid("12345678-9ABC-DEF0-1234-56789ABCDEF0").unwrap();
    let mut obj = TrackedObject::new(0x1000, 1, "00".repeat(32));
    let records = captured(|| {
        Classifier::default().apply(id, Some(&mut obj));
    });

    assert!(at(&records, Level::Warn).is_empty());
    assert!(at(&records, Level::Info)
        .iter()
        .any(|m| m.contains("not on list") && m.contains("12345678-9ABC-DEF0-1234-56789ABCDEF0")));
}

#[test]
fn missing_export_is_an_error_record() {
    let sim = SimulatedTarget::new()
        .with_module("ole32.dll", 0x7560_0000, &[("OleLoad", 0x7561_0000)])
        .load("ole32.dll")
        .exit(0);
    let config = SessionConfig {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        ..SessionConfig::new("WINWORD.EXE", "sample.rtf")
    };
    let records = captured(|| {
        Session::new(sim, config).run().unwrap();
    });

    let errors = at(&records, Level::Error);
    assert!(errors.iter().any(|m| m.contains("OleConvertOLESTREAMToIStorage")));
    assert!(errors.iter().any(|m| m.contains("OleGetAutoConvert")));
    assert!(!at(&records, Level::Info).is_empty());
}
