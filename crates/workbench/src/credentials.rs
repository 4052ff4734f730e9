//! Access token storage.
//!
//! The token lives in a `token` file next to the settings. `WORKBENCH_TOKEN`
//! takes precedence when set. Nothing here checks the token against a server.

use anyhow::{bail, Context, Result};
use log::info;
use std::path::{Path, PathBuf};

use crate::settings::config_dir;

/// Environment variable overriding the stored token.
pub const TOKEN_ENV: &str = "WORKBENCH_TOKEN";

pub struct CredentialStore {
    path: PathBuf,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(config_dir().join("token"))
    }
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The token from the environment, else from the token file.
    pub fn load(&self) -> Option<String> {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn save(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            bail!("refusing to store an empty token");
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&self.path, token)
            .with_context(|| format!("writing {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("Stored token at {}", self.path.display());
        Ok(())
    }

    /// Remove the stored token. Missing file is fine.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
        }
    }
}
