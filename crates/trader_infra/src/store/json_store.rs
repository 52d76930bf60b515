//! One pretty-printed JSON record per instrument: `<dir>/<symbol>.json`,
//! plus one per daily gate: `<dir>/<gate>.gate.json`.
//!
//! Writes go to a sibling temp file, are fsynced, then renamed over the
//! record, so a crash leaves either the previous record or the new one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use trader_core::error::PersistenceError;
use trader_core::instrument::{InstrumentState, InstrumentStore};
use trader_core::schedule::GateStore;

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (creating if needed) the state directory.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, symbol: &str) -> Result<PathBuf, PersistenceError> {
        if !is_file_stem(symbol) {
            return Err(PersistenceError::new(symbol, "symbol is not a valid file name"));
        }
        Ok(self.dir.join(format!("{symbol}.json")))
    }

    pub fn gate_path(&self, gate: &str) -> Result<PathBuf, PersistenceError> {
        if !is_file_stem(gate) {
            return Err(PersistenceError::new(gate, "gate is not a valid file name"));
        }
        Ok(self.dir.join(format!("{gate}.gate.json")))
    }

    fn replace(&self, key: &str, path: &Path, body: &[u8]) -> Result<(), PersistenceError> {
        let tmp = path.with_extension("json.tmp");
        blocking(|| {
            write_synced(&tmp, body).map_err(|e| {
                PersistenceError::new(key, format!("failed to write {}: {e}", tmp.display()))
            })?;
            fs::rename(&tmp, path).map_err(|e| {
                PersistenceError::new(key, format!("failed to replace {}: {e}", path.display()))
            })?;
            sync_dir(&self.dir);
            Ok(())
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GateRecord {
    gate: String,
    last_fired: NaiveDate,
}

impl InstrumentStore for JsonFileStore {
    fn load(&self, symbol: &str) -> Result<Option<InstrumentState>, PersistenceError> {
        let path = self.path_for(symbol)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PersistenceError::new(
                    symbol,
                    format!("failed to read {}: {e}", path.display()),
                ));
            }
        };
        let state: InstrumentState = serde_json::from_str(&raw).map_err(|e| {
            PersistenceError::new(symbol, format!("invalid record {}: {e}", path.display()))
        })?;
        if state.symbol != symbol {
            return Err(PersistenceError::new(
                symbol,
                format!("{} holds the record of {}", path.display(), state.symbol),
            ));
        }
        Ok(Some(state))
    }

    fn persist(&self, state: &InstrumentState) -> Result<(), PersistenceError> {
        let symbol = state.symbol.as_str();
        let path = self.path_for(symbol)?;
        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| PersistenceError::new(symbol, format!("failed to encode record: {e}")))?;
        self.replace(symbol, &path, &body)
    }
}

impl GateStore for JsonFileStore {
    fn last_fired(&self, gate: &str) -> Result<Option<NaiveDate>, PersistenceError> {
        let path = self.gate_path(gate)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PersistenceError::new(
                    gate,
                    format!("failed to read {}: {e}", path.display()),
                ));
            }
        };
        let record: GateRecord = serde_json::from_str(&raw).map_err(|e| {
            PersistenceError::new(gate, format!("invalid record {}: {e}", path.display()))
        })?;
        Ok(Some(record.last_fired))
    }

    fn record_fired(&self, gate: &str, day: NaiveDate) -> Result<(), PersistenceError> {
        let path = self.gate_path(gate)?;
        let record = GateRecord {
            gate: gate.to_owned(),
            last_fired: day,
        };
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| PersistenceError::new(gate, format!("failed to encode record: {e}")))?;
        self.replace(gate, &path, &body)
    }
}

fn is_file_stem(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Run a synchronous disk write. On a multi-threaded runtime the worker
/// thread is handed off first so other accounts' tasks keep running.
fn blocking<T>(write: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(write)
        }
        _ => write(),
    }
}

fn write_synced(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(body)?;
    file.write_all(b"\n")?;
    file.sync_all()
}

// Best effort: not every platform can open a directory for syncing.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
