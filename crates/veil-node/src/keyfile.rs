//! Persistence of the daemon's contact identity.
//!
//! The contact fingerprint is what others invite us by, so it has to
//! survive restarts. The key file is a JSON `IdentityExport`, readable by
//! the owner only.

use std::path::Path;

use tracing::info;

use veil_shared::identity::IdentityExport;
use veil_shared::{ContactIdentity, Identity, SelfIdentity};

use crate::error::DaemonError;

/// Load the contact identity stored at `path`, creating it on first use.
/// The flag is `true` when a new identity was generated.
pub async fn load_or_create(path: &Path) -> Result<(ContactIdentity, bool), DaemonError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let export: IdentityExport =
                serde_json::from_slice(&bytes).map_err(|source| DaemonError::KeyFileFormat {
                    path: path.to_path_buf(),
                    source,
                })?;
            let identity = SelfIdentity::from_export(&export).map_err(|source| {
                DaemonError::KeyFileIdentity {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            let contact = ContactIdentity::from_self(identity);
            info!(path = %path.display(), contact = %contact.fingerprint().short(), "Loaded contact identity");
            Ok((contact, false))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let contact = ContactIdentity::generate();
            store(path, &contact).await?;
            info!(path = %path.display(), contact = %contact.fingerprint().short(), "Created contact identity");
            Ok((contact, true))
        }
        Err(source) => Err(DaemonError::KeyFileIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn store(path: &Path, contact: &ContactIdentity) -> Result<(), DaemonError> {
    let io_err = |source| DaemonError::KeyFileIo {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let json = serde_json::to_vec_pretty(&contact.as_self().to_export()).map_err(|source| {
        DaemonError::KeyFileFormat {
            path: path.to_path_buf(),
            source,
        }
    })?;
    tokio::fs::write(path, json).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("contact.json");

        let (first, created) = load_or_create(&path).await.unwrap();
        assert!(created);
        let (second, created) = load_or_create(&path).await.unwrap();
        assert!(!created);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[tokio::test]
    async fn test_corrupt_key_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contact.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let result = load_or_create(&path).await;
        assert!(matches!(result, Err(DaemonError::KeyFileFormat { .. })));
    }

    #[tokio::test]
    async fn test_mismatched_halves_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contact.json");
        let mut export = SelfIdentity::generate().to_export();
        export.public_key = SelfIdentity::generate().public_key_bytes();
        tokio::fs::write(&path, serde_json::to_vec(&export).unwrap())
            .await
            .unwrap();

        let result = load_or_create(&path).await;
        assert!(matches!(result, Err(DaemonError::KeyFileIdentity { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("contact.json");
        load_or_create(&path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
