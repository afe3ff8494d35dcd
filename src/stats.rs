use std::fmt::Display;
use std::path::Path;

use anyhow::{Context, Result};

/// Named counters of one library run, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    entries: Vec<(String, String)>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, keeping its original position if it was already present.
    pub fn set<K: Into<String>, V: Display>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write one `key,value` row per counter, no header.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut w = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for (k, v) in self.iter() {
            w.write_record([k, v])?;
        }
        w.flush()?;
        Ok(())
    }
}
