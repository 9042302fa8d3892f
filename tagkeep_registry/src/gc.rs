//! Disk-level garbage collection via the registry's own binary.
//!
//! Tag deletion only unlinks manifests; reclaiming blob storage requires
//! running `registry garbage-collect` against the registry config. The
//! child's combined output is captured and re-logged whatever the exit
//! status, and cancellation kills the child and awaits its exit.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[async_trait]
pub trait GcRunner: Send + Sync {
    async fn collect(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Runs `<registry_binary> garbage-collect --delete-untagged <registry_config>`.
#[derive(Debug, Clone)]
pub struct RegistryGc {
    binary: PathBuf,
    config: PathBuf,
}

impl RegistryGc {
    pub fn new(binary: impl AsRef<Path>, config: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            config: config.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl GcRunner for RegistryGc {
    async fn collect(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        info!(binary = %self.binary.display(), "starting registry garbage collection");

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("garbage-collect")
            .arg("--delete-untagged")
            .arg(&self.config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.binary.display()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(drain(stdout));
        let err_task = tokio::spawn(drain(stderr));

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = cancel.cancelled() => {
                warn!("cancelling registry garbage collection");
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };

        let mut combined = out_task.await.unwrap_or_default();
        combined.extend(err_task.await.unwrap_or_default());
        for line in String::from_utf8_lossy(&combined).lines() {
            if !line.is_empty() {
                info!(target: "registry-gc", "{line}");
            }
        }

        match status {
            None => anyhow::bail!("garbage collection cancelled"),
            Some(status) if !status.success() => {
                anyhow::bail!("garbage-collect exited with {status}")
            }
            Some(_) => Ok(()),
        }
    }
}

async fn drain(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn fake_registry(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("registry");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn succeeds_on_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_registry(dir.path(), "echo collected; exit 0");
        let gc = RegistryGc::new(&bin, dir.path().join("config.yml"));
        gc.collect(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn fails_on_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_registry(dir.path(), "echo boom >&2; exit 3");
        let gc = RegistryGc::new(&bin, dir.path().join("config.yml"));
        let err = gc.collect(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("garbage-collect exited"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_registry(dir.path(), "sleep 30");
        let gc = RegistryGc::new(&bin, dir.path().join("config.yml"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gc.collect(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
