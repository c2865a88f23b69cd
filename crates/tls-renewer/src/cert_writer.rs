//! Certificate bundle persistence
//!
//! The bundle file holds `certificate + "\n" + private_key`. Writes are
//! atomic so readers (and a crash mid-write) never see a mix of old and new
//! content:
//! 1. Write to a sibling `<name>.tmp` file
//! 2. fsync
//! 3. Rename over the target (atomic on POSIX filesystems)

use crate::source::CertificateBundle;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while persisting a bundle
#[derive(Debug, Error)]
pub enum CertWriteError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create temp file for {target}: {source}")]
    TempFile {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write bundle to {target}: {source}")]
    Write {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to sync {target}: {source}")]
    Sync {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bundle write task failed: {0}")]
    Task(String),
}

/// Serialized file content for a bundle
pub fn bundle_contents(bundle: &CertificateBundle) -> String {
    let mut content = String::with_capacity(bundle.certificate.len() + bundle.private_key.len() + 1);
    content.push_str(&bundle.certificate);
    content.push('\n');
    content.push_str(&bundle.private_key);
    content
}

/// Write `bundle` to `path`, replacing any existing file
///
/// The file is created with mode 0600 on Unix since it carries the private
/// key.
pub fn write_bundle(bundle: &CertificateBundle, path: &Path) -> Result<(), CertWriteError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CertWriteError::CreateDir {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    write_file_atomic(path, bundle_contents(bundle).as_bytes())?;

    info!(
        path = %path.display(),
        expiration = bundle.expiration,
        "Certificate bundle written"
    );
    Ok(())
}

/// Async wrapper around [`write_bundle`] that runs on the blocking pool
pub async fn write_bundle_async(
    bundle: CertificateBundle,
    path: PathBuf,
) -> Result<(), CertWriteError> {
    tokio::task::spawn_blocking(move || write_bundle(&bundle, &path))
        .await
        .map_err(|e| CertWriteError::Task(e.to_string()))?
}

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

fn write_file_atomic(target: &Path, content: &[u8]) -> Result<(), CertWriteError> {
    let target_str = target.display().to_string();
    let temp_path = temp_path_for(target);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    // Mode applies at creation, so the key is never briefly world-readable
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(&temp_path)
        .map_err(|e| CertWriteError::TempFile {
            target: target_str.clone(),
            source: e,
        })?;

    let written = file
        .write_all(content)
        .map_err(|e| CertWriteError::Write {
            target: target_str.clone(),
            source: e,
        })
        .and_then(|()| {
            file.sync_all().map_err(|e| CertWriteError::Sync {
                target: target_str.clone(),
                source: e,
            })
        });
    drop(file);

    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    std::fs::rename(&temp_path, target).map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        CertWriteError::Rename {
            from: temp_path.display().to_string(),
            to: target_str,
            source: e,
        }
    })?;

    debug!(path = %target.display(), bytes = content.len(), "Atomic write complete");
    Ok(())
}
