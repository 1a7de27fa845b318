use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::lock::{FileLock, LockError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: u64,
    pub category: String,
    pub name: String,
    pub description: String,
    /// Ordered acceptance steps, verified one by one by the verification agent.
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    #[default]
    Open,
    Verifying,
    Passed,
    Failed,
}

/// How an agent run went wrong, recorded on the feature for the operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Environment,
    TestOnly,
    Implementation,
    Verification,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("failed to read feature file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse feature file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("feature not found: {0}")]
    NotFound(u64),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// The feature file is accepted in two shapes: a bare array of features, or
/// an object wrapping a `features` array. Whichever shape was read is the
/// shape written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileForm {
    Bare,
    Wrapped,
}

#[derive(Serialize, Deserialize)]
struct WrappedFile {
    features: Vec<Feature>,
}

/// Reads and mutates the persistent feature list. Every touch of the file
/// happens under a cross-process advisory lock; the orchestrator is the only
/// writer in this process but external tools edit the same file.
pub struct FeatureStore {
    path: PathBuf,
}

impl FeatureStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the complete feature list.
    pub fn load_features(&self) -> Result<Vec<Feature>, FeatureError> {
        let _lock = FileLock::acquire(&self.path)?;
        let (features, _) = read_file(&self.path)?;
        Ok(features)
    }

    /// Load a single feature, or None if the id is absent.
    pub fn get_feature(&self, id: u64) -> Result<Option<Feature>, FeatureError> {
        Ok(self.load_features()?.into_iter().find(|f| f.id == id))
    }

    /// Set a feature's status. Failure fields are cleared when the feature
    /// goes back to open or reaches passed, and set when it fails. Progress
    /// is overwritten only when provided.
    pub fn update_feature_status(
        &self,
        id: u64,
        status: FeatureStatus,
        failure_reason: Option<String>,
        failure_kind: Option<FailureKind>,
        progress: Option<String>,
    ) -> Result<Feature, FeatureError> {
        let _lock = FileLock::acquire(&self.path)?;
        let (mut features, form) = read_file(&self.path)?;

        let feature = features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(FeatureError::NotFound(id))?;

        feature.status = status;
        match status {
            FeatureStatus::Passed | FeatureStatus::Open => {
                feature.failure_reason = None;
                feature.failure_kind = None;
            }
            FeatureStatus::Failed => {
                feature.failure_reason = failure_reason;
                feature.failure_kind = failure_kind;
            }
            FeatureStatus::Verifying => {}
        }
        if progress.is_some() {
            feature.progress = progress;
        }

        let updated = feature.clone();
        write_file(&self.path, &features, form)?;
        Ok(updated)
    }
}

fn read_file(path: &Path) -> Result<(Vec<Feature>, FileForm), FeatureError> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    if value.is_array() {
        Ok((serde_json::from_value(value)?, FileForm::Bare))
    } else {
        let wrapped: WrappedFile = serde_json::from_value(value)?;
        Ok((wrapped.features, FileForm::Wrapped))
    }
}

fn write_file(path: &Path, features: &[Feature], form: FileForm) -> Result<(), FeatureError> {
    let content = match form {
        FileForm::Bare => serde_json::to_string_pretty(features)?,
        FileForm::Wrapped => serde_json::to_string_pretty(&WrappedFile {
            features: features.to_vec(),
        })?,
    };
    std::fs::write(path, content + "\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn sample_feature(id: u64, category: &str) -> Feature {
        Feature {
            id,
            category: category.into(),
            name: format!("Feature {id}"),
            description: "test feature".into(),
            steps: vec!["Step one works".into()],
            status: FeatureStatus::Open,
            failure_reason: None,
            failure_kind: None,
            progress: None,
        }
    }

    fn write_bare(dir: &Path, features: &[Feature]) -> PathBuf {
        let path = dir.join("features.json");
        std::fs::write(&path, serde_json::to_string_pretty(features).unwrap()).unwrap();
        path
    }

    fn write_wrapped(dir: &Path, features: &[Feature]) -> PathBuf {
        let path = dir.join("features.json");
        let wrapped = serde_json::json!({ "features": features });
        std::fs::write(&path, serde_json::to_string_pretty(&wrapped).unwrap()).unwrap();
        path
    }

    #[test]
    fn loads_bare_array_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bare(dir.path(), &[sample_feature(1, "core")]);
        let store = FeatureStore::new(path);
        let features = store.load_features().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, 1);
    }

    #[test]
    fn loads_wrapped_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wrapped(dir.path(), &[sample_feature(1, "core"), sample_feature(2, "ui")]);
        let store = FeatureStore::new(path);
        let features = store.load_features().unwrap();
        assert_eq!(features.len(), 2);
    }

    #[test]
    fn preserves_bare_form_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bare(dir.path(), &[sample_feature(1, "core")]);
        let store = FeatureStore::new(path.clone());

        store
            .update_feature_status(1, FeatureStatus::Passed, None, None, None)
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.trim_start().starts_with('['));
    }

    #[test]
    fn preserves_wrapped_form_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wrapped(dir.path(), &[sample_feature(1, "core")]);
        let store = FeatureStore::new(path.clone());

        store
            .update_feature_status(1, FeatureStatus::Passed, None, None, None)
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.trim_start().starts_with('{'));
        assert!(content.contains("\"features\""));
    }

    #[test]
    fn failed_sets_reason_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bare(dir.path(), &[sample_feature(1, "core")]);
        let store = FeatureStore::new(path);

        let updated = store
            .update_feature_status(
                1,
                FeatureStatus::Failed,
                Some("tests failed".into()),
                Some(FailureKind::TestOnly),
                None,
            )
            .unwrap();
        assert_eq!(updated.status, FeatureStatus::Failed);
        assert_eq!(updated.failure_reason.as_deref(), Some("tests failed"));
        assert_eq!(updated.failure_kind, Some(FailureKind::TestOnly));
    }

    #[test]
    fn passed_clears_failure_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut feature = sample_feature(1, "core");
        feature.status = FeatureStatus::Failed;
        feature.failure_reason = Some("broken".into());
        feature.failure_kind = Some(FailureKind::Implementation);
        let path = write_bare(dir.path(), &[feature]);
        let store = FeatureStore::new(path);

        let updated = store
            .update_feature_status(1, FeatureStatus::Passed, None, None, Some("done".into()))
            .unwrap();
        assert_eq!(updated.status, FeatureStatus::Passed);
        assert!(updated.failure_reason.is_none());
        assert!(updated.failure_kind.is_none());
        assert_eq!(updated.progress.as_deref(), Some("done"));
    }

    #[test]
    fn reopen_clears_failure_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut feature = sample_feature(1, "core");
        feature.status = FeatureStatus::Failed;
        feature.failure_reason = Some("broken".into());
        let path = write_bare(dir.path(), &[feature]);
        let store = FeatureStore::new(path);

        let updated = store
            .update_feature_status(1, FeatureStatus::Open, None, None, None)
            .unwrap();
        assert!(updated.failure_reason.is_none());
        assert!(updated.failure_kind.is_none());
    }

    #[test]
    fn progress_kept_when_not_provided() {
        let dir = tempfile::tempdir().unwrap();
        let mut feature = sample_feature(1, "core");
        feature.progress = Some("halfway".into());
        let path = write_bare(dir.path(), &[feature]);
        let store = FeatureStore::new(path);

        let updated = store
            .update_feature_status(1, FeatureStatus::Verifying, None, None, None)
            .unwrap();
        assert_eq!(updated.progress.as_deref(), Some("halfway"));
    }

    #[test]
    fn unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bare(dir.path(), &[sample_feature(1, "core")]);
        let store = FeatureStore::new(path);
        let result = store.update_feature_status(99, FeatureStatus::Passed, None, None, None);
        assert!(matches!(result, Err(FeatureError::NotFound(99))));
    }

    #[test]
    fn double_update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bare(dir.path(), &[sample_feature(1, "core")]);
        let store = FeatureStore::new(path.clone());

        store
            .update_feature_status(1, FeatureStatus::Passed, None, None, None)
            .unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        store
            .update_feature_status(1, FeatureStatus::Passed, None, None, None)
            .unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn get_feature_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bare(dir.path(), &[sample_feature(1, "core")]);
        let store = FeatureStore::new(path);
        assert!(store.get_feature(42).unwrap().is_none());
        assert_eq!(store.get_feature(1).unwrap().unwrap().id, 1);
    }

    #[test]
    fn verifying_keeps_failure_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut feature = sample_feature(1, "core");
        feature.failure_reason = Some("previous attempt".into());
        let path = write_bare(dir.path(), &[feature]);
        let store = FeatureStore::new(path);

        let updated = store
            .update_feature_status(1, FeatureStatus::Verifying, None, None, None)
            .unwrap();
        assert_eq!(updated.failure_reason.as_deref(), Some("previous attempt"));
    }
}
