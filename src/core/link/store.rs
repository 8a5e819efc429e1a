//! Persistence of the last bonded device.
//!
//! The store is an explicit capability injected into the controller: read
//! once at startup to decide whether auto-connect is attempted, written only
//! after a connection reaches full service + characteristic discovery.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::fs;

use crate::core::link::types::BondedDevice;

#[async_trait]
pub trait BondedStore: Send + Sync {
    async fn load(&self) -> Result<Option<BondedDevice>>;

    /// Overwrites the record. There is at most one bonded device at a time.
    async fn save(&self, device: &BondedDevice) -> Result<()>;
}

/// JSON-file-backed store, one small document at a caller-chosen path.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn ensure_parent_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create directory {parent:?}"))?;
                info!("Created store directory at {parent:?}");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BondedStore for JsonFileStore {
    async fn load(&self) -> Result<Option<BondedDevice>> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let device: BondedDevice = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt bonded-device record at {:?}", self.path))?;
                Ok(Some(device))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {:?}", self.path)),
        }
    }

    async fn save(&self, device: &BondedDevice) -> Result<()> {
        self.ensure_parent_exists().await?;
        let bytes = serde_json::to_vec_pretty(device)?;
        fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("failed to write {:?}", self.path))?;
        info!("Saved bonded device {} ({})", device.display_name, device.identifier);
        Ok(())
    }
}

/// In-memory store for tests and embedders that manage persistence
/// themselves.
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<Option<BondedDevice>>,
}

impl MemoryStore {
    pub fn new(record: Option<BondedDevice>) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

#[async_trait]
impl BondedStore for MemoryStore {
    async fn load(&self) -> Result<Option<BondedDevice>> {
        Ok(self.record.lock().unwrap().clone())
    }

    async fn save(&self, device: &BondedDevice) -> Result<()> {
        *self.record.lock().unwrap() = Some(device.clone());
        Ok(())
    }
}
