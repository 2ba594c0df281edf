use super::tree::{STAGING_DIR, copy_verified, tree_bytes};
use super::{Payload, Transport, UsageProbe, pull_url};
use crate::store::Store;
use crate::{LibrarianError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use ulid::Ulid;

/// Transport for stores whose `path` is a directory mounted on this host.
///
/// Payloads are copied into `{path}/.staging/{ulid}`, every file checksummed
/// against its source, and then renamed to `{path}/{name}`. An existing
/// destination is never overwritten.
#[derive(Debug, Default, Clone)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }

    async fn stage_and_commit(&self, store: &Store, payload: &Payload) -> Result<PathBuf> {
        let root = store_root(store)?;
        let destination = root.join(&payload.name);
        if fs::try_exists(&destination).await? {
            return Err(LibrarianError::InvalidRequest(format!(
                "{} already exists on store {}",
                payload.name, store.name
            )));
        }

        let staging = root.join(STAGING_DIR).join(Ulid::new().to_string());
        let staged = stage(&payload.source, &staging).await;
        let committed = match staged {
            Ok(()) => commit(&staging, &destination).await,
            Err(error) => Err(error),
        };

        if fs::try_exists(&staging).await.unwrap_or(false) {
            if let Err(error) = remove_path(&staging).await {
                tracing::warn!("failed to clean staging path {:?}: {}", staging, error);
            }
        }

        committed?;
        tracing::debug!(
            store = %store.name,
            "committed {} to {:?}",
            payload.name,
            destination
        );
        Ok(destination)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn push(&self, store: &Store, payload: &Payload) -> Result<()> {
        self.stage_and_commit(store, payload).await?;
        Ok(())
    }

    async fn expose_for_pull(&self, store: &Store, payload: &Payload) -> Result<String> {
        let url = pull_url(store, &payload.name)?;
        self.stage_and_commit(store, payload).await?;
        Ok(url)
    }
}

/// Measures a locally mounted store by summing the files under its root,
/// ignoring in-flight staging copies.
#[derive(Debug, Default, Clone)]
pub struct DiskUsageProbe;

impl DiskUsageProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UsageProbe for DiskUsageProbe {
    async fn occupied_bytes(&self, store: &Store) -> Result<u64> {
        let root = store_root(store)?;
        if !fs::try_exists(&root).await? {
            return Ok(0);
        }

        tree_bytes(root).await
    }
}

fn store_root(store: &Store) -> Result<PathBuf> {
    if store.path.trim().is_empty() {
        return Err(LibrarianError::Config(format!(
            "store {} has no storage path",
            store.name
        )));
    }
    Ok(PathBuf::from(&store.path))
}

async fn stage(source: &Path, staging: &Path) -> Result<()> {
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent).await?;
    }
    copy_verified(source.to_path_buf(), staging.to_path_buf()).await
}

async fn commit(staging: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::try_exists(destination).await? {
        return Err(LibrarianError::InvalidRequest(format!(
            "{:?} appeared while staging",
            destination
        )));
    }
    fs::rename(staging, destination).await?;
    Ok(())
}

async fn remove_path(path: &Path) -> Result<()> {
    if fs::metadata(path).await?.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreDescriptor;

    fn store_at(root: &Path) -> Store {
        StoreDescriptor::new("pot", 1 << 20)
            .with_path(root.to_string_lossy())
            .with_http_endpoint("http://pot.local/files")
            .store()
    }

    #[tokio::test]
    async fn push_stages_then_commits_and_refuses_overwrite() {
        let source_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("obs.uvh5");
        fs::write(&source, b"visibilities").await.unwrap();

        let store = store_at(store_dir.path());
        let payload = Payload::from_path(&source, "2458000/obs.uvh5").await.unwrap();
        assert_eq!(payload.size_bytes, 12);

        let transport = LocalTransport::new();
        transport.push(&store, &payload).await.unwrap();

        let landed = store_dir.path().join("2458000/obs.uvh5");
        assert_eq!(fs::read(&landed).await.unwrap(), b"visibilities");

        let err = transport.push(&store, &payload).await.unwrap_err();
        assert!(matches!(err, LibrarianError::InvalidRequest(_)));

        let mut staging = fs::read_dir(store_dir.path().join(STAGING_DIR)).await.unwrap();
        assert!(staging.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directories_are_copied_and_measured() {
        let source_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let tree = source_dir.path().join("zen.2458000.uv");
        fs::create_dir_all(tree.join("nested")).await.unwrap();
        fs::write(tree.join("header"), vec![1u8; 100]).await.unwrap();
        fs::write(tree.join("nested/data"), vec![2u8; 400]).await.unwrap();

        let payload = Payload::from_path(&tree, "zen.2458000.uv").await.unwrap();
        assert_eq!(payload.size_bytes, 500);

        let store = store_at(store_dir.path());
        let url = LocalTransport::new()
            .expose_for_pull(&store, &payload)
            .await
            .unwrap();
        assert_eq!(url, "http://pot.local/files/zen.2458000.uv");

        let probe = DiskUsageProbe::new();
        assert_eq!(probe.occupied_bytes(&store).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn disk_usage_ignores_staging_area() {
        let store_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(store_dir.path().join(STAGING_DIR))
            .await
            .unwrap();
        fs::write(store_dir.path().join(STAGING_DIR).join("partial"), vec![0u8; 64])
            .await
            .unwrap();
        fs::write(store_dir.path().join("kept"), vec![0u8; 32])
            .await
            .unwrap();

        let store = store_at(store_dir.path());
        assert_eq!(DiskUsageProbe::new().occupied_bytes(&store).await.unwrap(), 32);
    }
}
