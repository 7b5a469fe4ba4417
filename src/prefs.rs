use crate::error::StorageError;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// Stable preference keys. Renaming any of these requires a migration.
pub const PREF_OPT_IN: &str = "pref_anonymous_opt_in";
pub const PREF_OPT_OUT_PERSIST: &str = "pref_anonymous_opt_out_persist";
pub const PREF_FIRST_BOOT: &str = "pref_anonymous_first_boot";
pub const PREF_LAST_CHECKED: &str = "pref_anonymous_checked_in";
pub const PREF_LAST_REPORT_VERSION: &str = "pref_anonymous_last_rep_version";
pub const PREF_NEXT_ALARM: &str = "pref_anonymous_next_alarm";

/// File-backed preference store for checkin bookkeeping and consent flags.
///
/// Values live in a single JSON document; every put rewrites the file through
/// a temp-file rename so a crash mid-write never leaves a torn document.
/// There is exactly one writer (the active scheduler cycle), so two
/// independent puts are an acceptable stand-in for a transaction.
#[derive(Debug)]
pub struct Prefs {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl Prefs {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let values = if path.exists() {
            let contents = fs::read_to_string(path)
                .map_err(|e| StorageError::Read(format!("{}: {e}", path.display())))?;
            serde_json::from_str(&contents)
                .map_err(|e| StorageError::Read(format!("{}: {e}", path.display())))?
        } else {
            Map::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().unwrap().contains_key(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.lock().unwrap().get(key).and_then(Value::as_i64)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<(), StorageError> {
        self.put(key, Value::Bool(value))
    }

    pub fn put_i64(&self, key: &str, value: i64) -> Result<(), StorageError> {
        self.put(key, Value::from(value))
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.put(key, Value::from(value))
    }

    fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value);
        persist(&self.path, &values)
    }
}

fn persist(path: &Path, values: &Map<String, Value>) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StorageError::Write(format!("{}: {e}", parent.display())))?;
    }

    let contents = serde_json::to_string_pretty(&Value::Object(values.clone()))
        .map_err(|e| StorageError::Write(format!("serialize: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .map_err(|e| StorageError::Write(format!("{}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| StorageError::Write(format!("{}: {e}", path.display())))?;
    Ok(())
}
