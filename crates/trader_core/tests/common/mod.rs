#![allow(dead_code)]

use std::sync::Arc;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, FixedOffset};
use trader_core::codec::{FillKind, FillNotice};
use trader_core::instrument::{
    Holding, InstrumentSeed, InstrumentState, InstrumentStateMachine, MemoryStore, Side,
};

/// 32-byte session key and 16-byte IV used by every cipher test.
pub const KEY: &str = "0123456789abcdef0123456789abcdef";
pub const IV: &str = "fedcba9876543210";

pub fn kst(rfc3339: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap()
}

/// Session-day timestamp at `hh:mm:ss` (+09:00).
pub fn at(hms: &str) -> DateTime<FixedOffset> {
    kst(&format!("2024-03-04T{hms}+09:00"))
}

pub fn seed(symbol: &str, buy_trigger: u64, budget: u64, sell_trigger: u64) -> InstrumentSeed {
    InstrumentSeed {
        symbol: symbol.to_string(),
        display_name: format!("name-{symbol}"),
        buy_budget: budget,
        buy_trigger_price: buy_trigger,
        buy_quantity_original: 0,
        sell_trigger_price: sell_trigger,
        sell_target_ratio: None,
        trading_window_start: at("09:00:00"),
        trading_window_end: at("15:20:00"),
    }
}

pub fn holding(symbol: &str, quantity: u64, average_price: Option<f64>) -> Holding {
    Holding {
        symbol: symbol.to_string(),
        display_name: format!("name-{symbol}"),
        quantity,
        average_price,
        current_price: None,
        bought_today: 0,
        profit_rate: None,
    }
}

/// Machine seeded from `seed`, reconciled against `held` broker shares.
pub fn machine_with(
    seed: &InstrumentSeed,
    held: u64,
) -> (InstrumentStateMachine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let mut machine = InstrumentStateMachine::new(InstrumentState::from_seed(seed), store.clone());
    let h = holding(&seed.symbol, held, Some(1000.0));
    let broker = (held > 0).then_some(&h);
    machine.reconcile(broker, at("08:30:00")).unwrap();
    (machine, store)
}

pub fn notice(
    symbol: &str,
    side: Side,
    kind: FillKind,
    order_no: &str,
    qty: u64,
    price: u64,
    time: &str,
    order_qty: u64,
) -> FillNotice {
    FillNotice {
        order_number: order_no.to_string(),
        side,
        symbol: symbol.to_string(),
        filled_quantity: qty,
        filled_price: price,
        fill_time: time.to_string(),
        refused: false,
        kind,
        order_quantity: order_qty,
    }
}

pub fn confirm(symbol: &str, side: Side, qty: u64, price: u64, time: &str, order_qty: u64) -> FillNotice {
    notice(symbol, side, FillKind::Confirm, "0000000001", qty, price, time, order_qty)
}

/// Plaintext of a fill notice as the broker lays it out (17 fields).
pub fn fill_plaintext(
    symbol: &str,
    side_code: &str,
    kind_code: &str,
    order_no: &str,
    qty: u64,
    price: u64,
    time: &str,
    refused: bool,
    order_qty: u64,
) -> String {
    let qty = qty.to_string();
    let price = price.to_string();
    let order_qty = order_qty.to_string();
    [
        "HTSID",
        "5012345601",
        order_no,
        "",
        side_code,
        "0",
        "01",
        "0",
        symbol,
        qty.as_str(),
        price.as_str(),
        time,
        if refused { "1" } else { "0" },
        "0",
        kind_code,
        "Y",
        order_qty.as_str(),
    ]
    .join("^")
}

pub fn encrypt(plaintext: &str) -> String {
    let ciphertext = cbc::Encryptor::<aes::Aes256>::new_from_slices(KEY.as_bytes(), IV.as_bytes())
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    STANDARD.encode(ciphertext)
}

pub fn encrypted_fill_frame(plaintext: &str) -> String {
    format!("1|H0STCNI0|001|{}", encrypt(plaintext))
}

pub fn key_rotation_frame() -> String {
    format!(
        r#"{{"header":{{"tr_id":"H0STCNI0","tr_key":"HTSID","encrypt":"N"}},"body":{{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS","output":{{"iv":"{IV}","key":"{KEY}"}}}}}}"#
    )
}

pub fn quote_frame(symbol: &str, best_ask: u64, best_bid: u64) -> String {
    let mut fields = vec!["0".to_string(); 20];
    fields[0] = symbol.to_string();
    fields[1] = "093000".to_string();
    fields[3] = best_ask.to_string();
    fields[13] = best_bid.to_string();
    format!("0|H0STASP0|001|{}", fields.join("^"))
}

fn trade_record(symbol: &str, price: u64) -> String {
    let price = price.to_string();
    [symbol, "093001", price.as_str(), "2", "-50", "-0.5", "990", "1000", "1010", "980"].join("^")
}

pub fn trade_frame(symbol: &str, price: u64) -> String {
    format!("0|H0STCNT0|001|{}", trade_record(symbol, price))
}

pub fn multi_trade_frame(symbol: &str, prices: &[u64]) -> String {
    let records: Vec<String> = prices.iter().map(|p| trade_record(symbol, *p)).collect();
    format!("0|H0STCNT0|{:03}|{}", prices.len(), records.join("^"))
}

pub fn vi_frame(symbol: &str, direction: &str, price: u64) -> String {
    format!("0|H0STVI0|001|{symbol}^{direction}^{price}^093002^0")
}
