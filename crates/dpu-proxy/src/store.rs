//! Key-value tables read by the resolver.
//!
//! A table maps a key to a flat set of string fields. A missing key reads as
//! an empty field set, not an error.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

/// Field name to value.
pub type Fields = HashMap<String, String>;

/// A boxed future returned by table reads.
pub type TableFuture<'a> = Pin<Box<dyn Future<Output = Result<Fields, StoreError>> + Send + 'a>>;

/// Errors produced by table backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid table snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("table backend error: {0}")]
    Backend(String),
}

/// Read access to one key-value table.
pub trait TableReader: Send + Sync {
    /// Returns every field stored under `key`; empty when the key is absent.
    fn get_all<'a>(&'a self, key: &'a str) -> TableFuture<'a>;
}

/// In-process table, loadable from a JSON snapshot.
///
/// Snapshot format: `{"<key>": {"<field>": "<value>", ...}, ...}`.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: RwLock<HashMap<String, Fields>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: HashMap<String, Fields>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub async fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let raw = tokio::fs::read(path).await?;
        let rows: HashMap<String, Fields> = serde_json::from_slice(&raw)?;
        Ok(Self::from_rows(rows))
    }

    /// Sets fields under `key`, replacing existing values of the same name.
    pub fn insert<K, V>(&self, key: &str, fields: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let row = rows.entry(key.to_string()).or_default();
        for (k, v) in fields {
            row.insert(k.into(), v.into());
        }
    }

    pub fn remove(&self, key: &str) -> Option<Fields> {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TableReader for MemoryTable {
    fn get_all<'a>(&'a self, key: &'a str) -> TableFuture<'a> {
        let fields = self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(fields) })
    }
}
