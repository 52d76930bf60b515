//! File-backed instrument records: round trip, corruption, isolation.

mod common;

use std::fs;
use std::sync::Arc;

use chrono::TimeDelta;
use common::{at, seed, temp_dir};
use trader_core::instrument::{
    InstrumentState, InstrumentStore, LifecycleState, PendingOrder, Side,
};
use trader_core::schedule::GateStore;
use trader_infra::store::JsonFileStore;
use trader_infra::worker::build_router;

fn held_record(symbol: &str) -> InstrumentState {
    let mut state = InstrumentState::from_seed(&seed(symbol, 1000, 100_000, 1100));
    state.lifecycle = LifecycleState::SellSubmitted;
    state.held_quantity = 42;
    state.average_purchase_price = Some(987.5);
    state.sell_target_ratio = Some(0.035);
    state.last_traded_price = Some(1015);
    state.pending_order = Some(PendingOrder {
        side: Side::Sell,
        quantity: 42,
        recorded_at: at("11:12:13"),
        broker_accepted: true,
    });
    state.record_applied_fill("00000000deadbeef".into());
    state
}

// ─── Round trip ──────────────────────────────────────────────────────────

#[test]
fn test_persist_then_load_is_field_for_field_equal() {
    let dir = temp_dir("store_roundtrip");
    let store = JsonFileStore::open(&dir).unwrap();
    let record = held_record("005930");

    store.persist(&record).unwrap();
    let loaded = store.load("005930").unwrap().unwrap();
    assert_eq!(loaded, record);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_record_is_pretty_json_without_temp_leftovers() {
    let dir = temp_dir("store_layout");
    let store = JsonFileStore::open(&dir).unwrap();
    store.persist(&held_record("A")).unwrap();
    store.persist(&held_record("A")).unwrap();

    let names: Vec<String> = fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["A.json".to_string()]);

    let raw = fs::read_to_string(dir.join("A.json")).unwrap();
    assert!(raw.contains("\n  \"symbol\": \"A\""));
    assert!(raw.ends_with('\n'));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_missing_record_loads_as_none() {
    let dir = temp_dir("store_missing");
    let store = JsonFileStore::open(&dir).unwrap();
    assert!(store.load("A").unwrap().is_none());
    let _ = fs::remove_dir_all(&dir);
}

// ─── Failure modes ───────────────────────────────────────────────────────

#[test]
fn test_corrupted_record_is_an_error() {
    let dir = temp_dir("store_corrupt");
    let store = JsonFileStore::open(&dir).unwrap();
    fs::write(dir.join("A.json"), "{ not json").unwrap();
    let err = store.load("A").unwrap_err();
    assert_eq!(err.symbol, "A");
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_record_under_wrong_name_is_an_error() {
    let dir = temp_dir("store_mismatch");
    let store = JsonFileStore::open(&dir).unwrap();
    store.persist(&held_record("A")).unwrap();
    fs::rename(dir.join("A.json"), dir.join("B.json")).unwrap();
    assert!(store.load("B").is_err());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_path_like_symbols_are_refused() {
    let dir = temp_dir("store_symbol");
    let store = JsonFileStore::open(&dir).unwrap();
    assert!(store.path_for("../escape").is_err());
    assert!(store.path_for("").is_err());
    assert!(store.load("a/b").is_err());
    assert!(store.path_for("005930").is_ok());
    let _ = fs::remove_dir_all(&dir);
}

// ─── Gate records ────────────────────────────────────────────────────────

#[test]
fn test_gate_record_survives_reopen() {
    let dir = temp_dir("store_gate");
    let day = at("15:21:00").date_naive();
    {
        let store = JsonFileStore::open(&dir).unwrap();
        assert_eq!(store.last_fired("liquidation").unwrap(), None);
        store.record_fired("liquidation", day).unwrap();
    }

    let reopened = JsonFileStore::open(&dir).unwrap();
    assert_eq!(reopened.last_fired("liquidation").unwrap(), Some(day));
    let raw = fs::read_to_string(dir.join("liquidation.gate.json")).unwrap();
    assert!(raw.contains("\"last_fired\": \"2024-03-04\""));
    // gate records never shadow an instrument record
    assert_eq!(reopened.load("liquidation").unwrap(), None);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_corrupted_gate_record_is_an_error() {
    let dir = temp_dir("store_gate_corrupt");
    let store = JsonFileStore::open(&dir).unwrap();
    fs::write(dir.join("liquidation.gate.json"), "not json").unwrap();
    assert!(store.last_fired("liquidation").is_err());
    assert!(store.gate_path("../liquidation").is_err());
    let _ = fs::remove_dir_all(&dir);
}

// ─── Inside a runtime ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persist_from_multi_thread_runtime() {
    let dir = temp_dir("store_mt");
    let store = JsonFileStore::open(&dir).unwrap();
    let record = held_record("005930");
    store.persist(&record).unwrap();
    store.record_fired("liquidation", at("15:21:00").date_naive()).unwrap();
    assert_eq!(store.load("005930").unwrap(), Some(record));
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_persist_from_current_thread_runtime() {
    let dir = temp_dir("store_ct");
    let store = JsonFileStore::open(&dir).unwrap();
    let record = held_record("000660");
    store.persist(&record).unwrap();
    assert_eq!(store.load("000660").unwrap(), Some(record));
    let _ = fs::remove_dir_all(&dir);
}

// ─── Account isolation ───────────────────────────────────────────────────

#[test]
fn test_restarting_one_account_leaves_the_other_untouched() {
    let dir_a = temp_dir("store_acct_a");
    let dir_b = temp_dir("store_acct_b");
    let seeds = [seed("005930", 1000, 100_000, 1100), seed("000660", 2000, 50_000, 2200)];

    let store_b: Arc<dyn InstrumentStore> = Arc::new(JsonFileStore::open(&dir_b).unwrap());
    build_router("acct-b", &seeds, store_b).unwrap();
    let before: Vec<Vec<u8>> = seeds
        .iter()
        .map(|s| fs::read(dir_b.join(format!("{}.json", s.symbol))).unwrap())
        .collect();

    // account A starts, then restarts on the next trading day
    let store_a: Arc<dyn InstrumentStore> = Arc::new(JsonFileStore::open(&dir_a).unwrap());
    build_router("acct-a", &seeds, store_a.clone()).unwrap();
    let next_day: Vec<_> = seeds
        .iter()
        .map(|s| {
            let mut s = s.clone();
            s.trading_window_start += TimeDelta::days(1);
            s.trading_window_end += TimeDelta::days(1);
            s
        })
        .collect();
    let restarted = build_router("acct-a", &next_day, store_a.clone()).unwrap();
    assert_eq!(
        restarted.machine("005930").unwrap().state().trading_window_start,
        at("09:00:00") + TimeDelta::days(1)
    );

    let after: Vec<Vec<u8>> = seeds
        .iter()
        .map(|s| fs::read(dir_b.join(format!("{}.json", s.symbol))).unwrap())
        .collect();
    assert_eq!(before, after);
    assert_eq!(
        store_a.load("005930").unwrap().unwrap().trading_window_start,
        at("09:00:00") + TimeDelta::days(1)
    );

    let _ = fs::remove_dir_all(&dir_a);
    let _ = fs::remove_dir_all(&dir_b);
}
