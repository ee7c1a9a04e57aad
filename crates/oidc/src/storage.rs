use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{Error, Result, types::CachedTokenRecord};

/// Default cache location, relative to the working directory.
pub const DEFAULT_CACHE_FILE: &str = ".oidc-cache";

/// Single-record token cache backed by one JSON file.
///
/// Reads never fail: a missing or corrupt file is reported as "no token" so a
/// broken cache can never block re-authentication.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<CachedTokenRecord> {
        let path = self.path.display().to_string();
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "token cache not found");
                return None;
            },
            Err(e) => {
                warn!(path = %path, error = %e, "token cache read failed");
                return None;
            },
        };

        match serde_json::from_str::<CachedTokenRecord>(&data) {
            Ok(record) => {
                debug!(path = %path, expires_at = record.expires_at, "cached token loaded");
                Some(record)
            },
            Err(e) => {
                warn!(path = %path, error = %e, "token cache parse failed, ignoring it");
                None
            },
        }
    }

    /// Overwrite the cache file with `record`.
    pub fn save(&self, record: &CachedTokenRecord) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let data = serde_json::to_string_pretty(record)?;
        let mut file = open_private(&self.path).map_err(|source| self.io_error(source))?;
        file.write_all(data.as_bytes()).map_err(|source| self.io_error(source))?;

        // A file that already existed keeps its old mode through `open`.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(|source| self.io_error(source))?;
        }

        info!(path = %self.path.display(), "token cache written");
        Ok(())
    }

    /// Remove the cache file. Missing files are not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "token cache removed");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::CacheIo {
            path: self.path.clone(),
            source,
        }
    }
}

/// Open for writing, creating the file owner-only on unix.
fn open_private(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_FILE)
    }
}
