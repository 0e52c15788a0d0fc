//! Per-identity credential directories.
//!
//! Each identity gets `<root>/<digits>/`. The connector writes whatever it
//! needs there; the lifecycle only creates and deletes the directory.

use std::io;
use std::path::{Path, PathBuf};

use pairlink_core::Identity;
use tracing::debug;

/// Owner of the credential storage root.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// Store rooted at `root` (created lazily).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by `identity`.
    pub fn dir_for(&self, identity: &Identity) -> PathBuf {
        self.root.join(identity.as_str())
    }

    /// Create the identity's directory if missing and return its path.
    pub async fn prepare(&self, identity: &Identity) -> io::Result<PathBuf> {
        let dir = self.dir_for(identity);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Delete the identity's directory. Missing directories are fine.
    pub async fn discard(&self, identity: &Identity) -> io::Result<()> {
        let dir = self.dir_for(identity);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(identity = %identity, ?dir, "credential directory removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether the identity's directory currently exists.
    pub async fn exists(&self, identity: &Identity) -> bool {
        tokio::fs::try_exists(self.dir_for(identity))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::parse("15551234567").unwrap()
    }

    #[tokio::test]
    async fn prepare_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path().join("tokens"));
        let dir = store.prepare(&identity()).await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir, tmp.path().join("tokens").join("15551234567"));
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        let _ = store.prepare(&identity()).await.unwrap();
        let _ = store.prepare(&identity()).await.unwrap();
        assert!(store.exists(&identity()).await);
    }

    #[tokio::test]
    async fn discard_removes_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        let dir = store.prepare(&identity()).await.unwrap();
        std::fs::write(dir.join("creds.json"), b"{}").unwrap();
        store.discard(&identity()).await.unwrap();
        assert!(!store.exists(&identity()).await);
    }

    #[tokio::test]
    async fn discard_missing_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        store.discard(&identity()).await.unwrap();
    }

    #[tokio::test]
    async fn identities_do_not_share_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        let other = Identity::parse("4915112345678").unwrap();
        let _ = store.prepare(&identity()).await.unwrap();
        let _ = store.prepare(&other).await.unwrap();
        store.discard(&identity()).await.unwrap();
        assert!(store.exists(&other).await);
    }
}
