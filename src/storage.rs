//! Versioned artifact storage for trained autoencoders
//!
//! Layout of a store directory:
//!
//! ```text
//! 0.safetensors   0_cfg.json
//! 1.safetensors   1_cfg.json
//! ...
//! ```
//!
//! The store is an explicit handle; the next version id is computed from the
//! directory listing every time, so two handles on the same directory agree.
//! Both files are written to temporary names in the same directory and renamed
//! into place, so a failed save never leaves a half-written version behind.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use tracing::info;

use crate::config::SaeConfig;
use crate::error::SaeError;

const PARAMS_EXT: &str = "safetensors";
const CONFIG_SUFFIX: &str = "_cfg.json";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) a store directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create save directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn params_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("{version}.{PARAMS_EXT}"))
    }

    pub fn config_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("{version}{CONFIG_SUFFIX}"))
    }

    /// All version ids that have at least one file, ascending.
    pub fn versions(&self) -> Result<Vec<u32>> {
        let mut versions: Vec<u32> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?
        {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(v) = parse_version(name) {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        versions.dedup();
        Ok(versions)
    }

    /// `1 + max(existing)`, or 0 for an empty store.
    pub fn next_version(&self) -> Result<u32> {
        Ok(self.versions()?.last().map_or(0, |v| v + 1))
    }

    /// Most recent complete version (both files present).
    pub fn latest(&self) -> Result<Option<u32>> {
        Ok(self
            .versions()?
            .into_iter()
            .rev()
            .find(|v| self.params_path(*v).exists() && self.config_path(*v).exists()))
    }

    /// Write a new version and return its id.
    pub fn save(&self, tensors: &HashMap<String, Tensor>, cfg: &SaeConfig) -> Result<u32> {
        let version = self.next_version()?;

        let mut cfg_tmp = tempfile::Builder::new()
            .prefix(".tmp-cfg-")
            .tempfile_in(&self.dir)
            .context("Failed to create temporary config file")?;
        cfg_tmp.write_all(serde_json::to_string_pretty(cfg)?.as_bytes())?;
        cfg_tmp.flush()?;

        let params_tmp = tempfile::Builder::new()
            .prefix(".tmp-params-")
            .tempfile_in(&self.dir)
            .context("Failed to create temporary parameter file")?;
        candle_core::safetensors::save(tensors, params_tmp.path())
            .context("Failed to write parameters")?;

        let params_path = self.params_path(version);
        let config_path = self.config_path(version);
        params_tmp
            .persist(&params_path)
            .with_context(|| format!("Failed to move parameters to {}", params_path.display()))?;
        if let Err(e) = cfg_tmp.persist(&config_path) {
            // Never leave a parameter file without its config
            let _ = std::fs::remove_file(&params_path);
            return Err(e).with_context(|| {
                format!("Failed to move config to {}", config_path.display())
            });
        }

        info!("Saved as version {version} in {}", self.dir.display());
        Ok(version)
    }

    /// Read a version's parameters and config. Both files must exist.
    pub fn load(
        &self,
        version: u32,
        device: &Device,
    ) -> Result<(HashMap<String, Tensor>, SaeConfig)> {
        let params_path = self.params_path(version);
        let config_path = self.config_path(version);
        for path in [&config_path, &params_path] {
            if !path.exists() {
                return Err(SaeError::MissingArtifact {
                    version,
                    path: path.display().to_string(),
                }
                .into());
            }
        }

        let cfg = SaeConfig::load(&config_path)?;
        let tensors = candle_core::safetensors::load(&params_path, device)
            .with_context(|| format!("Failed to read {}", params_path.display()))?;
        info!("Loaded version {version} ({}) from {}", cfg.name, self.dir.display());
        Ok((tensors, cfg))
    }
}

/// `"12.safetensors"` or `"12_cfg.json"` -> `Some(12)`.
fn parse_version(file_name: &str) -> Option<u32> {
    let stem = file_name
        .strip_suffix(CONFIG_SUFFIX)
        .or_else(|| file_name.strip_suffix(&format!(".{PARAMS_EXT}")))?;
    stem.parse().ok()
}
