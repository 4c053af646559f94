//! Streams local files into running pods over an exec channel.
//!
//! The target pod runs `tar xvf - -C <dest>` and the archive is built in
//! memory and written to its stdin, so no volume or sidecar is needed to
//! seed workload data before a stress test begins.
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{api::AttachParams, Api};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::{error::Error, utils::Context};

/// Copies files into running pods.
pub struct FileStager<R, Rng> {
    cx: Arc<Context<R, Rng>>,
    namespace: String,
}

impl<R, Rng> FileStager<R, Rng> {
    /// Create a stager over the shared context.
    pub fn new(cx: Arc<Context<R, Rng>>, namespace: impl Into<String>) -> Self {
        Self {
            cx,
            namespace: namespace.into(),
        }
    }

    /// Copy `source` into `pod_name` at `dest_path`, stored under
    /// `archive_name` inside the archive.
    ///
    /// Transport failures propagate as [`Error::Staging`]; the caller decides
    /// whether to clean up.
    pub async fn stage_file(
        &self,
        pod_name: &str,
        archive_name: &str,
        source: &Path,
        dest_path: &str,
        namespace: Option<&str>,
    ) -> Result<(), Error> {
        let ns = namespace.unwrap_or(&self.namespace);
        self.stream_archive(pod_name, archive_name, source, dest_path, ns)
            .await
            .map_err(|source| Error::Staging {
                pod: pod_name.to_owned(),
                source,
            })
    }

    async fn stream_archive(
        &self,
        pod_name: &str,
        archive_name: &str,
        source: &Path,
        dest_path: &str,
        ns: &str,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.cx.k_client.clone(), ns);
        let command = vec!["tar", "xvf", "-", "-C", dest_path];
        let params = AttachParams {
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
            ..AttachParams::default()
        };
        let mut attached = api
            .exec(pod_name, command, &params)
            .await
            .context("opening exec channel")?;

        info!(source = %source.display(), pod = %pod_name, "uploading archive");
        let archive = build_archive(source, archive_name)?;

        let mut stdin = attached
            .stdin()
            .ok_or_else(|| anyhow!("exec channel has no stdin"))?;
        stdin.write_all(&archive).await.context("writing archive")?;
        stdin.shutdown().await.context("closing stdin")?;
        drop(stdin);

        if let Some(mut stdout) = attached.stdout() {
            let mut out = Vec::new();
            stdout.read_to_end(&mut out).await?;
            for line in String::from_utf8_lossy(&out).lines() {
                info!(pod = %pod_name, entry = %line, "unpacked");
            }
        }
        if let Some(mut stderr) = attached.stderr() {
            let mut out = Vec::new();
            stderr.read_to_end(&mut out).await?;
            for line in String::from_utf8_lossy(&out).lines() {
                warn!(pod = %pod_name, message = %line, "upload stderr");
            }
        }

        attached.join().await.context("closing exec channel")?;
        info!(pod = %pod_name, dest = %dest_path, "upload complete");
        Ok(())
    }
}

/// Build an in-memory tar archive holding `source` under `entry_name`.
pub(crate) fn build_archive(source: &Path, entry_name: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    if source.is_dir() {
        builder
            .append_dir_all(entry_name, source)
            .with_context(|| format!("archiving directory '{}'", source.display()))?;
    } else {
        builder
            .append_path_with_name(source, entry_name)
            .with_context(|| format!("archiving file '{}'", source.display()))?;
    }
    builder.into_inner().context("finishing archive")
}
