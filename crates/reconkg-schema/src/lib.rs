//! Schema loader
//!
//! Reads schema descriptors from a directory of `<name>.json` files and hands
//! validated `SchemaDescriptor`s to builders. Descriptors are cached by name
//! and invalidated when the file's modification time changes.
//!
//! Alias resolution is deliberately **not** this crate's concern: business
//! aliases live in the knowledge graph and are learned at build time.

use dashmap::DashMap;
use reconkg_model::schema::{ColumnDescriptor, SchemaDescriptor};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema `{0}` not found")]
    NotFound(String),
    #[error("schema `{name}` is invalid: {reasons:?}")]
    Invalid { name: String, reasons: Vec<String> },
    #[error("table `{table}` not found in schema `{schema}`")]
    TableNotFound { schema: String, table: String },
    #[error("failed to read schema `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse schema `{name}`: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

struct CachedSchema {
    descriptor: SchemaDescriptor,
    modified: Option<SystemTime>,
}

/// Directory-backed schema store with an mtime-invalidated cache.
pub struct SchemaStore {
    root: PathBuf,
    cache: DashMap<String, CachedSchema>,
}

impl SchemaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    /// Enumerate available schema names, sorted.
    pub fn list(&self) -> Result<Vec<String>, SchemaError> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(|source| SchemaError::Io {
            name: self.root.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| SchemaError::Io {
                name: self.root.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().map_or(false, |e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load a validated descriptor. Serves from cache while the backing file
    /// is unchanged.
    pub fn load(&self, name: &str) -> Result<SchemaDescriptor, SchemaError> {
        let path = self.path_of(name);
        if !path.exists() {
            return Err(SchemaError::NotFound(name.to_string()));
        }
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok();

        if let Some(cached) = self.cache.get(name) {
            if cached.modified == modified {
                return Ok(cached.descriptor.clone());
            }
            debug!(schema = name, "schema file changed, reloading");
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| SchemaError::Io {
            name: name.to_string(),
            source,
        })?;
        let descriptor: SchemaDescriptor =
            serde_json::from_str(&contents).map_err(|source| SchemaError::Parse {
                name: name.to_string(),
                source,
            })?;

        let reasons = descriptor.validation_errors(name);
        if !reasons.is_empty() {
            return Err(SchemaError::Invalid {
                name: name.to_string(),
                reasons,
            });
        }
        if descriptor.total_tables != descriptor.tables.len() {
            warn!(
                schema = name,
                declared = descriptor.total_tables,
                actual = descriptor.tables.len(),
                "total_tables does not match table count"
            );
        }

        self.cache.insert(
            name.to_string(),
            CachedSchema {
                descriptor: descriptor.clone(),
                modified,
            },
        );
        Ok(descriptor)
    }

    pub fn tables_of(&self, name: &str) -> Result<Vec<String>, SchemaError> {
        Ok(self.load(name)?.table_names())
    }

    /// Columns of a table, in declared order.
    pub fn columns_of(
        &self,
        name: &str,
        table: &str,
    ) -> Result<Vec<ColumnDescriptor>, SchemaError> {
        let schema = self.load(name)?;
        schema
            .table(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| SchemaError::TableNotFound {
                schema: name.to_string(),
                table: table.to_string(),
            })
    }
}
