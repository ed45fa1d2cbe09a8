//! Class id table and classification tests.

use rtfraptor::classifier::{clsid_from_bytes, parse_clsid, KNOWN_CLSIDS, UNKNOWN_DESCRIPTION};
use rtfraptor::{Classification, Classifier, ClsidTable, Error, TrackedObject};

const EQUATION: &str = "0002CE02-0000-0000-C000-000000000046";

#[test]
fn equation_editor_is_listed() {
    let id = parse_clsid(EQUATION).unwrap();
    let class = Classifier::default().classify(&id);
    assert!(class.is_known());
    assert!(class.description().contains("CVE-2017-11882"));
}

#[test]
fn every_builtin_entry_classifies_as_known() {
    let c = Classifier::default();
    for (id, desc) in KNOWN_CLSIDS {
        assert_eq!(c.classify(id), Classification::Known(desc.to_string()));
    }
}

#[test]
fn apply_annotates_the_object() {
    let raw = [
        0x02, 0xCE, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x46,
    ];
    let id = clsid_from_bytes(&raw).unwrap();
    let mut obj = TrackedObject::new(0x1000, 42, "ab".repeat(32));
    let class = Classifier::default().apply(id, Some(&mut obj));
    assert!(class.is_known());
    assert_eq!(obj.class_id_string().as_deref(), Some(EQUATION));
    assert!(obj.is_known());
}

#[test]
fn unknown_is_recorded_with_marker() {
    let id = parse_clsid("{12345678-9ABC-DEF0-1234-56789ABCDEF0}").unwrap();
    let mut obj = TrackedObject::new(0x1000, 1, "00".repeat(32));
    let class = Classifier::default().apply(id, Some(&mut obj));
    assert_eq!(class, Classification::Unknown);
    assert_eq!(obj.description.as_deref(), Some(UNKNOWN_DESCRIPTION));
    assert!(!obj.is_known());
}

#[test]
fn apply_without_object_only_logs() {
    let id = parse_clsid(EQUATION).unwrap();
    assert!(Classifier::default().apply(id, None).is_known());
}

#[test]
#[cfg(feature = "serde")]
fn json_database_extends_the_table() {
    let mut table = ClsidTable::builtin();
    let before = table.len();
    let added = table
        .extend_from_json(
            r#"{
                "{11111111-2222-3333-4444-555555555555}": "Custom control",
                "0002ce02-0000-0000-c000-000000000046": "Equation Editor (local note)"
            }"#,
        )
        .unwrap();
    assert_eq!(added, 2);
    assert_eq!(table.len(), before + 1);

    let c = Classifier::new(table);
    let custom = parse_clsid("11111111-2222-3333-4444-555555555555").unwrap();
    assert_eq!(c.classify(&custom).description(), "Custom control");
    let eq = parse_clsid(EQUATION).unwrap();
    assert_eq!(c.classify(&eq).description(), "Equation Editor (local note)");
}

#[test]
#[cfg(feature = "serde")]
fn bad_json_database_leaves_table_untouched() {
    let mut table = ClsidTable::empty();
    let err = table
        .extend_from_json(r#"{"11111111-2222-3333-4444-555555555555": "ok", "nope": "bad"}"#)
        .unwrap_err();
    assert!(matches!(err, Error::ClsidDatabase(_)));
    assert!(table.is_empty());

    assert!(matches!(table.extend_from_json("[1, 2]"), Err(Error::ClsidDatabase(_))));
}

#[test]
fn empty_table_knows_nothing() {
    let c = Classifier::new(ClsidTable::empty());
    let id = parse_clsid(EQUATION).unwrap();
    assert_eq!(c.classify(&id), Classification::Unknown);
}
