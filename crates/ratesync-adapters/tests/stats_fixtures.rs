use std::path::PathBuf;

use chrono::NaiveDate;
use ratesync_adapters::{parse_stats_payload, FetchFailure};

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

#[test]
fn full_payload_populates_every_mode() {
    let snapshot = parse_stats_payload(&fixture("full.json")).expect("parse");
    assert_eq!(snapshot.fast.rating, Some(1500));
    assert_eq!(snapshot.fast.deviation, Some(40));
    assert_eq!(snapshot.fast.last_played, date(2024, 1, 1));
    assert_eq!(snapshot.medium.rating, Some(1650));
    assert_eq!(snapshot.medium.last_played, date(2024, 3, 1));
    assert_eq!(snapshot.slow.rating, Some(1720));
    assert_eq!(snapshot.slow.last_played, date(2024, 4, 1));
}

#[test]
fn partial_payload_leaves_missing_modes_absent() {
    let snapshot = parse_stats_payload(&fixture("partial.json")).expect("parse");
    assert!(snapshot.fast.is_empty());
    assert_eq!(snapshot.medium.rating, Some(1650));
    assert_eq!(snapshot.medium.deviation, Some(28));
    assert_eq!(snapshot.medium.last_played, date(2024, 3, 1));
    // rapid section exists but has no last game
    assert!(snapshot.slow.is_empty());
}

#[test]
fn missing_fields_inside_a_mode_stay_absent() {
    let snapshot = parse_stats_payload(&fixture("sparse_fields.json")).expect("parse");
    assert_eq!(snapshot.slow.rating, Some(1800));
    assert_eq!(snapshot.slow.deviation, None);
    assert_eq!(snapshot.slow.last_played, None);
}

#[test]
fn wrongly_typed_rating_is_malformed() {
    let err = parse_stats_payload(&fixture("malformed.json")).expect_err("must fail");
    assert!(matches!(err, FetchFailure::Malformed(_)));
}
