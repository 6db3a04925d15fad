//! Atomic persistence of the generated engine config.
//!
//! The document is written to a temp file next to the destination, synced,
//! and renamed over it. Readers see either the previous file or the new one.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::error::{VpnError, VpnResult};
use super::generator::GeneratedConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigWriter;

impl ConfigWriter {
    pub fn new() -> Self {
        Self
    }

    /// Serialize `config` and atomically replace `path`.
    pub async fn write(&self, config: &GeneratedConfig, path: &Path) -> VpnResult<()> {
        self.stage(config, path).await?.commit().await
    }

    /// Write the temp file without touching `path`. Dropping the returned
    /// handle without committing removes the temp file.
    pub async fn stage(&self, config: &GeneratedConfig, path: &Path) -> VpnResult<StagedConfig> {
        let mut bytes = serde_json::to_vec_pretty(config)
            .map_err(|e| VpnError::persist(path, std::io::Error::other(e)))?;
        bytes.push(b'\n');
        self.stage_bytes(&bytes, path).await
    }

    async fn stage_bytes(&self, bytes: &[u8], path: &Path) -> VpnResult<StagedConfig> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| VpnError::persist(&dir, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".into());
        let staged = StagedConfig {
            temp: dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple())),
            target: path.to_path_buf(),
            committed: false,
        };

        let mut file = tokio::fs::File::create(&staged.temp)
            .await
            .map_err(|e| VpnError::persist(&staged.temp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| VpnError::persist(&staged.temp, e))?;
        file.flush()
            .await
            .map_err(|e| VpnError::persist(&staged.temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| VpnError::persist(&staged.temp, e))?;

        Ok(staged)
    }
}

/// A fully written temp file waiting to be renamed into place.
#[derive(Debug)]
pub struct StagedConfig {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedConfig {
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub async fn commit(mut self) -> VpnResult<()> {
        tokio::fs::rename(&self.temp, &self.target)
            .await
            .map_err(|e| VpnError::persist(&self.target, e))?;
        self.committed = true;
        tracing::debug!(path = %self.target.display(), "engine config written");
        Ok(())
    }
}

impl Drop for StagedConfig {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}
