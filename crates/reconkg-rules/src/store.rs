//! Ruleset persistence
//!
//! Mirrors the graph store: one JSON document per ruleset id, written
//! atomically, cached in-process.

use parking_lot::RwLock;
use reconkg_model::rules::RuleSet;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum RulesetStoreError {
    #[error("ruleset `{0}` not found")]
    NotFound(String),
    #[error("ruleset store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt ruleset document `{name}`: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invariant violation in ruleset `{name}`: {source}")]
    Invariant {
        name: String,
        #[source]
        source: reconkg_model::InvariantViolation,
    },
}

pub trait RulesetStore: Send + Sync {
    fn save(&self, ruleset: &RuleSet) -> Result<(), RulesetStoreError>;
    fn load(&self, ruleset_id: &str) -> Result<RuleSet, RulesetStoreError>;
    /// Most recently created ruleset with this name.
    fn load_by_name(&self, name: &str) -> Result<RuleSet, RulesetStoreError>;
    fn list(&self) -> Result<Vec<String>, RulesetStoreError>;
    fn delete(&self, ruleset_id: &str) -> Result<(), RulesetStoreError>;
}

pub struct FsRulesetStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, RuleSet>>,
}

impl FsRulesetStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RulesetStoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn path_of(&self, ruleset_id: &str) -> PathBuf {
        self.root.join(format!("{ruleset_id}.ruleset.json"))
    }

    fn read_document(&self, path: &Path, name: &str) -> Result<RuleSet, RulesetStoreError> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|source| RulesetStoreError::Corrupt {
            name: name.to_string(),
            source,
        })
    }
}

impl RulesetStore for FsRulesetStore {
    fn save(&self, ruleset: &RuleSet) -> Result<(), RulesetStoreError> {
        ruleset
            .verify_invariants()
            .map_err(|source| RulesetStoreError::Invariant {
                name: ruleset.ruleset_id.clone(),
                source,
            })?;
        let mut cache = self.cache.write();
        let path = self.path_of(&ruleset.ruleset_id);
        let tmp = path.with_extension("ruleset.json.tmp");
        let bytes = serde_json::to_vec_pretty(ruleset).map_err(|source| {
            RulesetStoreError::Corrupt {
                name: ruleset.ruleset_id.clone(),
                source,
            }
        })?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        cache.insert(ruleset.ruleset_id.clone(), ruleset.clone());
        Ok(())
    }

    fn load(&self, ruleset_id: &str) -> Result<RuleSet, RulesetStoreError> {
        if let Some(ruleset) = self.cache.read().get(ruleset_id) {
            return Ok(ruleset.clone());
        }
        let path = self.path_of(ruleset_id);
        if !path.exists() {
            return Err(RulesetStoreError::NotFound(ruleset_id.to_string()));
        }
        let ruleset = self.read_document(&path, ruleset_id)?;
        self.cache
            .write()
            .insert(ruleset_id.to_string(), ruleset.clone());
        Ok(ruleset)
    }

    fn load_by_name(&self, name: &str) -> Result<RuleSet, RulesetStoreError> {
        let mut best: Option<RuleSet> = None;
        for id in self.list()? {
            let candidate = self.load(&id)?;
            if candidate.ruleset_name == name {
                let newer = best
                    .as_ref()
                    .map_or(true, |b| candidate.created_at > b.created_at);
                if newer {
                    best = Some(candidate);
                }
            }
        }
        best.ok_or_else(|| RulesetStoreError::NotFound(name.to_string()))
    }

    fn list(&self) -> Result<Vec<String>, RulesetStoreError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(".ruleset.json") {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, ruleset_id: &str) -> Result<(), RulesetStoreError> {
        let path = self.path_of(ruleset_id);
        if !path.exists() {
            return Err(RulesetStoreError::NotFound(ruleset_id.to_string()));
        }
        std::fs::remove_file(path)?;
        self.cache.write().remove(ruleset_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reconkg_model::rules::{MatchType, ReconciliationRule, ValidationStatus};

    fn ruleset(id: &str, name: &str) -> RuleSet {
        RuleSet {
            ruleset_id: id.to_string(),
            ruleset_name: name.to_string(),
            schemas: vec!["a".to_string()],
            rules: vec![ReconciliationRule {
                rule_id: "r1".to_string(),
                rule_name: "r".to_string(),
                source_schema: "a".to_string(),
                source_table: "t".to_string(),
                source_columns: vec!["c".to_string()],
                target_schema: "a".to_string(),
                target_table: "u".to_string(),
                target_columns: vec!["d".to_string()],
                match_type: MatchType::Exact,
                transformation: None,
                confidence: 0.9,
                reasoning: String::new(),
                validation_status: ValidationStatus::Valid,
                llm_generated: false,
                created_at: Utc::now(),
                join_tables: None,
                join_conditions: None,
                join_order: None,
                join_types: None,
            }],
            generated_from_kg: "kg".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRulesetStore::new(dir.path()).unwrap();
        let rs = ruleset("rs-1", "gpu");
        store.save(&rs).unwrap();
        assert_eq!(store.load("rs-1").unwrap(), rs);
    }

    #[test]
    fn load_by_name_returns_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRulesetStore::new(dir.path()).unwrap();
        let mut older = ruleset("rs-1", "gpu");
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        let newer = ruleset("rs-2", "gpu");
        store.save(&older).unwrap();
        store.save(&newer).unwrap();
        assert_eq!(store.load_by_name("gpu").unwrap().ruleset_id, "rs-2");
    }

    #[test]
    fn duplicate_rule_ids_fail_to_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRulesetStore::new(dir.path()).unwrap();
        let mut rs = ruleset("rs-1", "gpu");
        let duplicate = rs.rules[0].clone();
        rs.rules.push(duplicate);
        assert!(matches!(
            store.save(&rs),
            Err(RulesetStoreError::Invariant { .. })
        ));
    }

    #[test]
    fn durable_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsRulesetStore::new(dir.path()).unwrap();
            store.save(&ruleset("rs-1", "gpu")).unwrap();
        }
        let reopened = FsRulesetStore::new(dir.path()).unwrap();
        assert_eq!(reopened.list().unwrap(), vec!["rs-1"]);
        assert_eq!(reopened.load("rs-1").unwrap().ruleset_name, "gpu");
    }
}
