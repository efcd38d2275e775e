//! Settings and collection access shared by all commands.

use anyhow::{bail, Context, Result};
use flashmark_core::{Collection, SyncConfig};
use std::path::{Path, PathBuf};

use crate::settings;

pub struct App {
    pub config: SyncConfig,
    pub collection_path: PathBuf,
}

impl App {
    /// Loads the configuration and settles which collection to use:
    /// `--collection`, then the configuration's `collectionPath`, then the
    /// platform default.
    pub fn new(config_path: Option<&Path>, collection: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(settings::config_file_path);
        let config = settings::load_config(&config_path)?;
        Ok(Self::with_config(config, collection))
    }

    pub fn with_config(config: SyncConfig, collection: Option<&Path>) -> Self {
        let collection_path = collection
            .map(Path::to_path_buf)
            .or_else(|| config.collection_path.clone())
            .unwrap_or_else(settings::default_collection_path);
        Self {
            config,
            collection_path,
        }
    }

    pub fn open_collection(&self) -> Result<Collection> {
        if !self.collection_path.exists() {
            bail!(
                "no collection at {} (create one with `flashmark init`)",
                self.collection_path.display()
            );
        }
        let collection = Collection::open(&self.collection_path)
            .map_err(|e| anyhow::anyhow!(e.user_message()))
            .with_context(|| format!("opening {}", self.collection_path.display()))?;
        log::debug!("opened collection {}", self.collection_path.display());
        Ok(collection)
    }
}
