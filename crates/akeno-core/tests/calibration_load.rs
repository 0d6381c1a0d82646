//! Calibration loading tests - JSON documents, binary images and boot fallback

use akeno_core::calibration::{CalibrationDocument, CalibrationError, CalibrationSet, CalibrationStore};
use akeno_core::diagnostics::{Diagnostics, FaultKind};
use pretty_assertions::assert_eq;
use std::fs;

fn tuned_set() -> CalibrationSet {
    let mut set = CalibrationSet::fallback();
    set.scalars.injector_size = 600;
    set.scalars.max_total_retard = 120;
    set
}

#[test]
fn test_json_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");

    let set = tuned_set();
    let json = serde_json::to_string_pretty(&set.to_document()).unwrap();
    fs::write(&path, json).unwrap();

    let loaded = CalibrationSet::from_file(&path).expect("should load JSON calibration");
    assert_eq!(loaded, set);
}

#[test]
fn test_image_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.bin");

    let set = tuned_set();
    fs::write(&path, set.to_document().to_image().unwrap()).unwrap();

    let loaded = CalibrationSet::from_file(&path).expect("should load calibration image");
    assert_eq!(loaded, set);
}

#[test]
fn test_image_trailer_crc_checked() {
    let mut image = tuned_set().to_document().to_image().unwrap();
    let last = image.len() - 1;
    image[last] ^= 0x01;

    let err = CalibrationDocument::from_image(&image).unwrap_err();
    assert!(matches!(err, CalibrationError::CrcMismatch { .. }), "got {:?}", err);
}

#[test]
fn test_corrupted_table_blob_names_the_table() {
    let mut image = tuned_set().to_document().to_image().unwrap();
    // header (6) + name length (1) + "coolant_pump_duty" (17) + blob length (4)
    // puts the first blob at 28; skip its rank and axis length
    image[28 + 3] ^= 0x80;

    match CalibrationDocument::from_image(&image) {
        Err(CalibrationError::InvalidTable { name, source }) => {
            assert_eq!(name, "coolant_pump_duty");
            assert!(matches!(*source, CalibrationError::CrcMismatch { .. }));
        }
        other => panic!("expected a table CRC error, got {:?}", other),
    }
}

#[test]
fn test_json_missing_table_rejected() {
    let mut doc = tuned_set().to_document();
    doc.tables.remove("torque_map");
    let json = serde_json::to_string(&doc).unwrap();

    let err = CalibrationSet::from_json_str(&json).unwrap_err();
    assert!(matches!(err, CalibrationError::MissingTable(ref n) if n == "torque_map"));
}

#[test]
fn test_json_unknown_table_rejected() {
    let mut doc = tuned_set().to_document();
    let extra = doc.tables["coolant_pump_duty"].clone();
    doc.tables.insert("boost_by_gear".to_string(), extra);
    let json = serde_json::to_string(&doc).unwrap();

    let err = CalibrationSet::from_json_str(&json).unwrap_err();
    assert!(matches!(err, CalibrationError::UnknownTable(ref n) if n == "boost_by_gear"));
}

#[test]
fn test_malformed_axis_reported_with_table_name() {
    let mut doc = tuned_set().to_document();
    if let Some(table) = doc.tables.get_mut("fuel_injector_dead_times") {
        table.axes[0].swap(0, 1);
    }

    let err = CalibrationSet::from_document(doc).unwrap_err();
    assert!(
        err.to_string().contains("fuel_injector_dead_times"),
        "error should name the table: {}",
        err
    );
}

#[test]
fn test_boot_uses_fallback_for_unreadable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.bin");
    fs::write(&path, b"not a calibration").unwrap();

    let diag = Diagnostics::new();
    let store = CalibrationStore::boot(CalibrationSet::from_file(&path), &diag);

    assert!(store.is_fallback());
    assert_eq!(*store.current(), CalibrationSet::fallback());
    assert_eq!(diag.count(FaultKind::MalformedCalibration), 1);
}

#[test]
fn test_boot_keeps_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.bin");
    fs::write(&path, tuned_set().to_document().to_image().unwrap()).unwrap();

    let diag = Diagnostics::new();
    let store = CalibrationStore::boot(CalibrationSet::from_file(&path), &diag);

    assert!(!store.is_fallback());
    assert_eq!(store.current().scalars.injector_size, 600);
    assert_eq!(diag.count(FaultKind::MalformedCalibration), 0);
}
