//! Persistence seam for received files. The engine never touches the
//! filesystem directly; the injected store decides where (and whether)
//! a reassembled file lands.

use std::future::Future;
use std::path::{Path, PathBuf};

use crate::error::PortalError;

pub trait FileStore: Send + Sync + 'static {
    /// Choose the destination path for an incoming file. Returning
    /// `None` declines the file; the transfer completes without
    /// persisting anything.
    fn pick_save_location(&self, name: &str) -> impl Future<Output = Option<PathBuf>> + Send;

    fn write_file(
        &self,
        path: &Path,
        contents: &[u8],
    ) -> impl Future<Output = Result<(), PortalError>> + Send;
}

/// Default store: saves every incoming file into a fixed download
/// directory, creating it on demand.
#[derive(Debug, Clone)]
pub struct DownloadDirStore {
    dir: PathBuf,
}

impl DownloadDirStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

/// Strip any path components a sender may have smuggled into the name.
fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("unknown_file.bin")
        .to_string()
}

impl FileStore for DownloadDirStore {
    async fn pick_save_location(&self, name: &str) -> Option<PathBuf> {
        Some(self.dir.join(sanitize_name(name)))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), PortalError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PortalError::PersistFailed(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| PortalError::PersistFailed(format!("{}: {e}", path.display())))
    }
}
