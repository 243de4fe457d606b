//! Job definitions as submitted by the coordinator.

use crate::error::{EngineError, Result};
use crate::signature::Signature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Walk paths and store every regular file.
    Backup,
    /// Retrieve stored signatures and write them to the target backends.
    Restore,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Backup => write!(f, "backup"),
            JobKind::Restore => write!(f, "restore"),
        }
    }
}

/// String options passed to a backend or transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(pub BTreeMap<String, String>);

impl Options {
    /// Empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Value for a key that must be present and non-empty.
    pub fn require(&self, component: &str, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(EngineError::InvalidOption {
                component: component.to_string(),
                key: key.to_string(),
                reason: "required".to_string(),
            }),
        }
    }

    /// Parse an integer option, falling back to `default` when absent.
    pub fn parse_i32(&self, component: &str, key: &str, default: i32) -> Result<i32> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| EngineError::InvalidOption {
                component: component.to_string(),
                key: key.to_string(),
                reason: format!("not an integer: {raw:?}"),
            }),
        }
    }
}

/// A named backend or transform together with its options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Registered constructor name.
    pub name: String,
    /// Options handed to `configure`.
    #[serde(default)]
    pub options: Options,
}

impl ComponentSpec {
    /// Component with no options.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Options::default(),
        }
    }

    /// Component with options.
    pub fn with_options(name: impl Into<String>, options: Options) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// A backup root and the paths excluded below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSpec {
    /// Directory (or single file) to walk.
    pub root: PathBuf,
    /// Paths to skip. Relative entries are resolved against `root`.
    #[serde(default)]
    pub excludes: Vec<PathBuf>,
}

impl PathSpec {
    /// Root with no excludes.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes: Vec::new(),
        }
    }

    /// Excludes resolved to absolute-or-root-joined form.
    pub fn resolved_excludes(&self) -> Vec<PathBuf> {
        self.excludes
            .iter()
            .map(|e| if e.is_absolute() { e.clone() } else { self.root.join(e) })
            .collect()
    }
}

/// Everything the orchestrator needs to run one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Backup destinations, or the restore target(s).
    #[serde(default)]
    pub to: Vec<ComponentSpec>,
    /// Restore source.
    #[serde(default)]
    pub from: Option<ComponentSpec>,
    /// Transforms in forward order.
    #[serde(default)]
    pub modifications: Vec<ComponentSpec>,
    /// Backup roots.
    #[serde(default)]
    pub paths: Vec<PathSpec>,
    /// Signatures to restore.
    #[serde(default)]
    pub files: Vec<Signature>,
}

impl JobDefinition {
    /// Check that the fields required by `kind` are present.
    pub fn validate(&self, kind: JobKind) -> Result<()> {
        if self.to.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "at least one `to` backend is required".into(),
            ));
        }
        match kind {
            JobKind::Backup => {
                if self.paths.is_empty() {
                    return Err(EngineError::InvalidDefinition(
                        "backup requires at least one path".into(),
                    ));
                }
            }
            JobKind::Restore => {
                if self.from.is_none() {
                    return Err(EngineError::InvalidDefinition(
                        "restore requires a `from` backend".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Parse a definition from JSON.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backup_definition() {
        let def = JobDefinition::from_json(
            r#"{
                "to": [{"name": "local", "options": {"path": "/srv/backup"}}, {"name": "log"}],
                "modifications": [{"name": "compress", "options": {"level": "5"}}],
                "paths": [{"root": "/home/user", "excludes": ["cache"]}]
            }"#,
        )
        .unwrap();
        assert_eq!(def.to.len(), 2);
        assert_eq!(def.to[0].options.get("path"), Some("/srv/backup"));
        assert!(def.to[1].options.0.is_empty());
        assert_eq!(def.modifications[0].name, "compress");
        assert_eq!(
            def.paths[0].resolved_excludes(),
            vec![PathBuf::from("/home/user/cache")]
        );
        def.validate(JobKind::Backup).unwrap();
        assert!(def.validate(JobKind::Restore).is_err());
    }

    #[test]
    fn test_validate_requires_to() {
        let def = JobDefinition {
            paths: vec![PathSpec::new("/tmp")],
            ..Default::default()
        };
        assert!(matches!(
            def.validate(JobKind::Backup),
            Err(EngineError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_options_accessors() {
        let opts = Options::new().with("level", "7").with("empty", " ");
        assert_eq!(opts.parse_i32("compress", "level", 3).unwrap(), 7);
        assert_eq!(opts.parse_i32("compress", "missing", 3).unwrap(), 3);
        assert!(opts.require("local", "empty").is_err());
        assert!(opts.require("local", "path").is_err());

        let bad = Options::new().with("level", "fast");
        assert!(matches!(
            bad.parse_i32("compress", "level", 3),
            Err(EngineError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(JobDefinition::from_json("{ not json").is_err());
    }
}
