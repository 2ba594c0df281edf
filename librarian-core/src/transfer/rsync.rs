use super::tree::STAGING_DIR;
use super::{DiskUsageProbe, Payload, Transport, UsageProbe, pull_url};
use crate::store::Store;
use crate::{LibrarianError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;

/// Transport that shells out to `rsync` against the store's rsync endpoint.
///
/// `rsync://host/module` endpoints use the daemon protocol; anything else is
/// treated as an ssh login (`user@host`) and the store path is appended after
/// a colon. An empty endpoint means the store path is local to this host.
/// Interrupted copies are kept under the destination's `.staging` directory,
/// which usage probes do not count.
#[derive(Debug, Clone)]
pub struct RsyncTransport {
    binary: String,
    extra_args: Vec<String>,
}

impl Default for RsyncTransport {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl RsyncTransport {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn destination(store: &Store, name: &str) -> String {
        let path = store.path.trim_end_matches('/');
        let endpoint = store.rsync_endpoint.trim();

        if endpoint.is_empty() {
            return format!("{}/{}", path, name);
        }

        if endpoint.starts_with("rsync://") {
            let base = endpoint.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            if path.is_empty() {
                return format!("{}/{}", base, name);
            }
            return format!("{}/{}/{}", base, path, name);
        }

        format!("{}:{}/{}", endpoint, path, name)
    }

    /// A directory source gets a trailing slash so its contents, not the
    /// directory itself, land at `destination`.
    fn arguments(&self, source: &Path, source_is_dir: bool, destination: &str) -> Vec<OsString> {
        let mut source = source.as_os_str().to_owned();
        if source_is_dir && !source.to_string_lossy().ends_with('/') {
            source.push("/");
        }

        let mut args: Vec<OsString> = vec![
            "-a".into(),
            format!("--partial-dir={}", STAGING_DIR).into(),
            "--mkpath".into(),
        ];
        args.extend(self.extra_args.iter().map(OsString::from));
        args.push(source);
        args.push(destination.into());
        args
    }

    async fn sync(&self, store: &Store, payload: &Payload) -> Result<()> {
        let destination = Self::destination(store, &payload.name);
        let source_is_dir = tokio::fs::metadata(&payload.source)
            .await
            .map_err(|error| {
                LibrarianError::InvalidRequest(format!(
                    "cannot read {}: {}",
                    payload.source.display(),
                    error
                ))
            })?
            .is_dir();

        let mut command = Command::new(&self.binary);
        command
            .args(self.arguments(&payload.source, source_is_dir, &destination))
            .kill_on_drop(true);

        tracing::debug!(
            store = %store.name,
            "running {} for {} -> {}",
            self.binary,
            payload.source.display(),
            destination
        );

        let output = command.output().await.map_err(|error| {
            LibrarianError::TransferFailed {
                reason: format!("failed to spawn {}: {}", self.binary, error),
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LibrarianError::TransferFailed {
                reason: format!(
                    "{} exited with {} for {}: {}",
                    self.binary,
                    output.status,
                    destination,
                    stderr.trim()
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for RsyncTransport {
    async fn push(&self, store: &Store, payload: &Payload) -> Result<()> {
        self.sync(store, payload).await
    }

    async fn expose_for_pull(&self, store: &Store, payload: &Payload) -> Result<String> {
        let url = pull_url(store, &payload.name)?;
        self.sync(store, payload).await?;
        Ok(url)
    }
}

/// Measures stores reached over ssh by running `du -sb` on the remote host.
/// Stores without an rsync endpoint are measured on the local filesystem.
#[derive(Debug, Clone)]
pub struct RemoteDuProbe {
    ssh_binary: String,
    local: DiskUsageProbe,
}

impl Default for RemoteDuProbe {
    fn default() -> Self {
        Self::new("ssh")
    }
}

impl RemoteDuProbe {
    pub fn new(ssh_binary: impl Into<String>) -> Self {
        Self {
            ssh_binary: ssh_binary.into(),
            local: DiskUsageProbe::new(),
        }
    }
}

#[async_trait]
impl UsageProbe for RemoteDuProbe {
    async fn occupied_bytes(&self, store: &Store) -> Result<u64> {
        let endpoint = store.rsync_endpoint.trim();
        if endpoint.is_empty() {
            return self.local.occupied_bytes(store).await;
        }
        if endpoint.starts_with("rsync://") {
            return Err(LibrarianError::Config(format!(
                "store {} uses an rsync daemon endpoint and cannot be measured over ssh",
                store.name
            )));
        }

        let output = Command::new(&self.ssh_binary)
            .arg(endpoint)
            .arg("du")
            .arg("-sb")
            .arg(format!("--exclude={}", STAGING_DIR))
            .arg(&store.path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(LibrarianError::Internal(format!(
                "du on {} exited with {}: {}",
                endpoint,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_du_output(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_du_output(stdout: &str) -> Result<u64> {
    stdout
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<u64>().ok())
        .ok_or_else(|| LibrarianError::Internal(format!("unexpected du output: {}", stdout.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreDescriptor;

    #[test]
    fn destinations_follow_endpoint_kind() {
        let ssh = StoreDescriptor::new("Store 0", 1)
            .with_rsync_endpoint("obs@pot1.karoo")
            .with_path("/data/store0/")
            .store();
        assert_eq!(
            RsyncTransport::destination(&ssh, "2458000/a.uvh5"),
            "obs@pot1.karoo:/data/store0/2458000/a.uvh5"
        );

        let daemon = StoreDescriptor::new("Store 1", 1)
            .with_rsync_endpoint("rsync://pot2.karoo/librarian/")
            .with_path("/incoming")
            .store();
        assert_eq!(
            RsyncTransport::destination(&daemon, "a.uvh5"),
            "rsync://pot2.karoo/librarian/incoming/a.uvh5"
        );

        let local = StoreDescriptor::new("Store 2", 1)
            .with_path("/mnt/store2")
            .store();
        assert_eq!(
            RsyncTransport::destination(&local, "a.uvh5"),
            "/mnt/store2/a.uvh5"
        );
    }

    #[tokio::test]
    async fn unreadable_source_is_not_retried() {
        let store = StoreDescriptor::new("Store 0", 1)
            .with_path("/nonexistent")
            .store();
        let payload = Payload {
            name: "a.uvh5".to_string(),
            source: "/nonexistent/a.uvh5".into(),
            size_bytes: 1,
        };

        let err = RsyncTransport::default().push(&store, &payload).await.unwrap_err();
        assert!(matches!(err, LibrarianError::InvalidRequest(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn du_output_is_parsed() {
        assert_eq!(parse_du_output("5000000000000\t/data/store0\n").unwrap(), 5_000_000_000_000);
        assert!(parse_du_output("du: cannot access").is_err());
    }

    #[tokio::test]
    async fn directory_sources_sync_their_contents() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("zen.2458000.uv");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("header"), b"uv").unwrap();
        let file = dir.path().join("zen.2458000.uvh5");
        std::fs::write(&file, b"uvh5").unwrap();

        let transport = RsyncTransport::default().with_args(vec!["--chmod=F644".to_string()]);
        let destination = "obs@pot1.karoo:/data/store0/zen.2458000.uv";

        let payload = Payload::from_path(&tree, "zen.2458000.uv").await.unwrap();
        let is_dir = tokio::fs::metadata(&payload.source).await.unwrap().is_dir();
        let args = transport.arguments(&payload.source, is_dir, destination);
        assert_eq!(
            args,
            vec![
                OsString::from("-a"),
                OsString::from("--partial-dir=.staging"),
                OsString::from("--mkpath"),
                OsString::from("--chmod=F644"),
                OsString::from(format!("{}/", tree.display())),
                OsString::from(destination),
            ]
        );

        let args = transport.arguments(&file, false, "/mnt/store2/zen.2458000.uvh5");
        assert_eq!(args[4], file.clone().into_os_string());
    }

    #[tokio::test]
    async fn missing_binary_surfaces_transfer_failure() {
        let source = tempfile::NamedTempFile::new().unwrap();
        let store = StoreDescriptor::new("Store 0", 1)
            .with_path("/nonexistent")
            .store();
        let payload = Payload {
            name: "a.uvh5".to_string(),
            source: source.path().to_path_buf(),
            size_bytes: 1,
        };

        let transport = RsyncTransport::new("/nonexistent/bin/rsync-librarian-test");
        let err = transport.push(&store, &payload).await.unwrap_err();
        assert!(matches!(err, LibrarianError::TransferFailed { .. }));
    }
}
