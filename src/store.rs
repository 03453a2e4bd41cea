use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_WHISPER_MODEL: &str = "base";

/// Flat key/value settings persisted as one JSON document. Every mutation
/// is a locked read-modify-write followed by an atomic rename, so
/// concurrent writers cannot interleave partial documents. A file that
/// fails to parse is treated as empty rather than wedging the app.
pub struct JsonStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("settings.json"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let _g = self.lock.lock().unwrap();
        let doc = self.read_doc();
        doc.get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let _g = self.lock.lock().unwrap();
        let mut doc = self.read_doc();
        doc.insert(key.to_string(), serde_json::to_value(value)?);
        self.write_doc(&doc)
    }

    pub fn whisper_model(&self) -> String {
        self.get::<String>("whisperModel")
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WHISPER_MODEL.to_string())
    }

    pub fn set_whisper_model(&self, model: &str) -> Result<()> {
        self.set("whisperModel", &model)
    }

    fn read_doc(&self) -> Map<String, Value> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Map::new();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    fn write_doc(&self, doc: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create settings dir {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(&Value::Object(doc.clone()))?;
        std::fs::write(&tmp, raw)
            .with_context(|| format!("write settings {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace settings {}", self.path.display()))?;
        Ok(())
    }
}
