//! Copying generated images from the ComfyUI host to local disk.
//!
//! Two strategies are provided behind the [`ArtifactFetcher`] trait:
//!
//! - [`ScpFetcher`] copies straight out of the server's output directory
//!   with `scp`, for hosts reachable over SSH.
//! - [`HttpFetcher`] downloads through ComfyUI's own `GET /view`
//!   endpoint.
//!
//! Both create the destination's parent directories first.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::ImageRef;

/// Error type for artifact retrieval.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("copy program '{program}' could not be started: {source}")]
    NotFound {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("copy program '{program}' did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("remote copy failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("download failed: {0}")]
    Api(#[from] ComfyUIApiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retrieves one generated image into a local file.
pub trait ArtifactFetcher: Send + Sync {
    /// Copy `image` to `destination`, overwriting any existing file.
    fn fetch(
        &self,
        image: &ImageRef,
        destination: &Path,
    ) -> impl std::future::Future<Output = Result<(), FetchError>> + Send;
}

async fn ensure_parent_dir(destination: &Path) -> Result<(), FetchError> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// scp
// ---------------------------------------------------------------------------

/// Default copy program.
pub const DEFAULT_SCP_PROGRAM: &str = "scp";
/// SSH connect timeout passed to `scp`, in seconds.
pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default limit on one whole copy; the child is killed after it.
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(120);

/// Copies `{remote_host}:{remote_output_dir}/{subfolder}/{filename}` with
/// `scp -q`.
///
/// SSH runs in batch mode, so a host that wants a password fails at once
/// instead of prompting. Key-based auth has to be set up beforehand.
#[derive(Debug, Clone)]
pub struct ScpFetcher {
    program: String,
    remote_host: String,
    remote_output_dir: String,
    timeout: Duration,
}

impl ScpFetcher {
    pub fn new(remote_host: String, remote_output_dir: String) -> Self {
        Self {
            program: DEFAULT_SCP_PROGRAM.to_string(),
            remote_host,
            remote_output_dir: remote_output_dir.trim_end_matches('/').to_string(),
            timeout: DEFAULT_COPY_TIMEOUT,
        }
    }

    /// Kill the copy if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a different binary with scp-compatible arguments.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// The `host:path` source argument for `image`.
    pub fn source_spec(&self, image: &ImageRef) -> String {
        let mut remote = PathBuf::from(&self.remote_output_dir);
        if !image.subfolder.is_empty() {
            remote.push(&image.subfolder);
        }
        remote.push(&image.filename);
        format!("{}:{}", self.remote_host, remote.display())
    }

    fn command_args(&self, source: &str, destination: &Path) -> Vec<OsString> {
        vec![
            "-q".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}").into(),
            source.into(),
            destination.into(),
        ]
    }
}

impl ArtifactFetcher for ScpFetcher {
    async fn fetch(&self, image: &ImageRef, destination: &Path) -> Result<(), FetchError> {
        ensure_parent_dir(destination).await?;
        let source = self.source_spec(image);

        tracing::debug!(source = %source, destination = %destination.display(), "Copying artifact");

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(self.command_args(&source, destination))
            .kill_on_drop(true);

        // On timeout the `output()` future is dropped, which kills the child.
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| FetchError::TimedOut {
                program: self.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| FetchError::NotFound {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(FetchError::ExecutionFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP /view
// ---------------------------------------------------------------------------

/// Downloads through the ComfyUI `/view` endpoint.
///
/// The body goes to a `.part` sibling that is renamed over the
/// destination only once complete. A failed download removes the
/// `.part` file and leaves any earlier image in place.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    api: ComfyUIApi,
}

impl HttpFetcher {
    pub fn new(api: ComfyUIApi) -> Self {
        Self { api }
    }
}

impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, image: &ImageRef, destination: &Path) -> Result<(), FetchError> {
        ensure_parent_dir(destination).await?;

        let response = self.api.view(image).await?;

        let partial = partial_path(destination);
        let written = match write_body(response, &partial).await {
            Ok(written) => written,
            Err(e) => {
                tokio::fs::remove_file(&partial).await.ok();
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, destination).await?;

        tracing::debug!(
            filename = %image.filename,
            destination = %destination.display(),
            bytes = written,
            "Downloaded artifact",
        );
        Ok(())
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut partial = destination.as_os_str().to_owned();
    partial.push(".part");
    PathBuf::from(partial)
}

/// Stream `response` into a new file at `path`. Returns the byte count.
async fn write_body(mut response: reqwest::Response, path: &Path) -> Result<u64, FetchError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(ComfyUIApiError::from)? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

// ---------------------------------------------------------------------------
// Runtime selection
// ---------------------------------------------------------------------------

/// Fetcher chosen from configuration at startup.
#[derive(Debug, Clone)]
pub enum Fetcher {
    Scp(ScpFetcher),
    Http(HttpFetcher),
}

impl ArtifactFetcher for Fetcher {
    async fn fetch(&self, image: &ImageRef, destination: &Path) -> Result<(), FetchError> {
        match self {
            Fetcher::Scp(f) => f.fetch(image, destination).await,
            Fetcher::Http(f) => f.fetch(image, destination).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn image(filename: &str, subfolder: &str) -> ImageRef {
        ImageRef {
            filename: filename.to_string(),
            subfolder: subfolder.to_string(),
            kind: "output".to_string(),
        }
    }

    #[test]
    fn source_spec_joins_host_and_path() {
        let f = ScpFetcher::new("10.0.0.5".into(), "/opt/ComfyUI/output/".into());
        assert_eq!(
            f.source_spec(&image("cat_00001_.png", "")),
            "10.0.0.5:/opt/ComfyUI/output/cat_00001_.png"
        );
    }

    #[test]
    fn source_spec_includes_subfolder() {
        let f = ScpFetcher::new("gpu".into(), "/out".into());
        assert_eq!(f.source_spec(&image("a.png", "avatars")), "gpu:/out/avatars/a.png");
    }

    #[tokio::test]
    async fn successful_copy_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cat").join("home.png");
        // `true` ignores its arguments and exits 0.
        let f = ScpFetcher::new("host".into(), "/out".into()).with_program("true");

        f.fetch(&image("a.png", ""), &dest).await.unwrap();
        assert!(dir.path().join("cat").is_dir());
    }

    #[tokio::test]
    async fn failing_copy_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let f = ScpFetcher::new("host".into(), "/out".into()).with_program("false");

        let result = f.fetch(&image("a.png", ""), &dir.path().join("a.png")).await;
        assert_matches!(result, Err(FetchError::ExecutionFailed { exit_code: Some(1), .. }));
    }

    #[test]
    fn ssh_runs_non_interactively_with_connect_timeout() {
        let f = ScpFetcher::new("gpu".into(), "/out".into());
        let args = f.command_args("gpu:/out/a.png", Path::new("/tmp/a.png"));

        let args: Vec<&str> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "-q",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "gpu:/out/a.png",
                "/tmp/a.png",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_copy_is_killed_after_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("stall");
        std::fs::write(&program, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let f = ScpFetcher::new("host".into(), "/out".into())
            .with_program(program.to_string_lossy())
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = f.fetch(&image("a.png", ""), &dir.path().join("a.png")).await;

        assert_matches!(result, Err(FetchError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let f = ScpFetcher::new("host".into(), "/out".into())
            .with_program("avagen-no-such-copy-program");

        let result = f.fetch(&image("a.png", ""), &dir.path().join("a.png")).await;
        assert_matches!(result, Err(FetchError::NotFound { .. }));
    }
}
