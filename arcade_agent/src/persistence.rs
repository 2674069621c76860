//! Durable checkpoints for estimator parameters.
//!
//! A checkpoint is written to a temporary file next to the target and then
//! renamed over it, so a crash mid-write leaves the previous checkpoint in
//! place. Loading never fails the process: a missing or undecodable file
//! reads as "no checkpoint".

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Human-readable, used for the Q-table.
    Json,
    /// Compact binary, used for network weights.
    Bincode,
}

#[derive(Debug, Clone)]
pub struct PersistenceManager {
    path: PathBuf,
    format: CheckpointFormat,
}

impl PersistenceManager {
    pub fn new(path: impl AsRef<Path>, format: CheckpointFormat) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format,
        }
    }

    pub fn json(path: impl AsRef<Path>) -> Self {
        Self::new(path, CheckpointFormat::Json)
    }

    pub fn bincode(path: impl AsRef<Path>) -> Self {
        Self::new(path, CheckpointFormat::Bincode)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Serialize `value` and replace the checkpoint with it.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = match self.format {
            CheckpointFormat::Json => serde_json::to_vec(value)?,
            CheckpointFormat::Bincode => bincode::serialize(value)?,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint directory {:?}", dir))?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temporary checkpoint in {:?}", dir))?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace checkpoint {:?}", self.path))?;

        debug!("Checkpoint written to {:?} ({} bytes)", self.path, bytes.len());
        Ok(())
    }

    /// Read the checkpoint. `Ok(None)` when there is none; errors when it
    /// exists but cannot be read or decoded.
    pub fn try_load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if !self.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&self.path)
            .with_context(|| format!("Failed to read checkpoint {:?}", self.path))?;
        let value = match self.format {
            CheckpointFormat::Json => serde_json::from_slice(&bytes)
                .with_context(|| format!("Corrupt JSON checkpoint {:?}", self.path))?,
            CheckpointFormat::Bincode => bincode::deserialize(&bytes)
                .with_context(|| format!("Corrupt binary checkpoint {:?}", self.path))?,
        };
        Ok(Some(value))
    }

    /// Like [`try_load`](Self::try_load) but a broken checkpoint is logged and
    /// treated as absent.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        match self.try_load() {
            Ok(value) => {
                if value.is_none() {
                    debug!("No checkpoint at {:?}, starting fresh", self.path);
                }
                value
            }
            Err(e) => {
                warn!("Ignoring unreadable checkpoint: {:#}", e);
                None
            }
        }
    }
}
