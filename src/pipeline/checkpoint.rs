//! Resumable run checkpoints
//!
//! A single file, atomically replaced (write-tmp-then-rename) so a crash
//! mid-write never corrupts the previous checkpoint. Losing the file is
//! harmless: discovery re-runs from the seeds and the store suppresses
//! duplicate work.

use crate::config::RunConfig;
use crate::model::PaperId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Checkpoint layout understood by this build. Backwards-incompatible
/// changes bump it; resuming from a higher version is refused.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed checkpoint: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("checkpoint schema version {found} is newer than supported {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
}

/// Snapshot of run-resumable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub schema_version: u32,
    pub config: RunConfig,
    /// Pending (id, depth) pairs, BFS order.
    pub queue: Vec<(PaperId, u32)>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: String, config: RunConfig, queue: Vec<(PaperId, u32)>) -> Self {
        Self {
            run_id,
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            config,
            queue,
            created_at: Utc::now(),
        }
    }

    /// Write atomically: serialize to a sibling tmp file, then rename
    /// over the target.
    pub fn write_atomic(&self, path: &Path) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load and verify the schema version.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let body = std::fs::read(path)?;
        let checkpoint: Self = serde_json::from_slice(&body)?;
        if checkpoint.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointError::UnsupportedSchema {
                found: checkpoint.schema_version,
                supported: CHECKPOINT_SCHEMA_VERSION,
            });
        }
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> RunConfig {
        RunConfig::from_seeds(vec![PaperId::from("2401.00001")])
    }

    #[test]
    fn round_trip_preserves_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let queue = vec![
            (PaperId::from("A"), 0),
            (PaperId::from("B"), 1),
            (PaperId::from("C"), 1),
        ];
        let checkpoint = Checkpoint::new("run-1".into(), sample_config(), queue.clone());
        checkpoint.write_atomic(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert_eq!(loaded.queue, queue);
        assert_eq!(loaded.config.seeds, sample_config().seeds);
    }

    #[test]
    fn queue_serializes_as_id_depth_pairs() {
        let checkpoint = Checkpoint::new(
            "run-1".into(),
            sample_config(),
            vec![(PaperId::from("X"), 2)],
        );
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["queue"][0][0], "X");
        assert_eq!(json["queue"][0][1], 2);
        assert!(json["created_at"].is_string());
    }

    #[test]
    fn rewrite_replaces_rather_than_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        Checkpoint::new("run-1".into(), sample_config(), vec![(PaperId::from("A"), 0)])
            .write_atomic(&path)
            .unwrap();
        Checkpoint::new("run-1".into(), sample_config(), vec![(PaperId::from("B"), 1)])
            .write_atomic(&path)
            .unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.queue, vec![(PaperId::from("B"), 1)]);
    }

    #[test]
    fn newer_schema_version_refuses_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut checkpoint = Checkpoint::new("run-1".into(), sample_config(), vec![]);
        checkpoint.schema_version = CHECKPOINT_SCHEMA_VERSION + 1;
        let body = serde_json::to_vec(&checkpoint).unwrap();
        std::fs::write(&path, body).unwrap();

        let err = Checkpoint::load(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedSchema { .. }));
    }

    #[test]
    fn garbage_on_disk_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            Checkpoint::load(&path).unwrap_err(),
            CheckpointError::Malformed(_)
        ));
    }
}
