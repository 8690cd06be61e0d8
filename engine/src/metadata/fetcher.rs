use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::{EngineError, Result};
use crate::utils::os;
use crate::utils::url::SourceKind;

/// Metadata-only invocations of the downloader.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Write the metadata document for `url` to `dest`.
    async fn fetch_document(&self, url: &str, kind: SourceKind, dest: &Path) -> Result<()>;

    /// Raw text of the "formats joinable from the start" listing of a live resource.
    async fn list_live_from_start_formats(&self, url: &str) -> Result<String>;
}

/// `MetadataSource` backed by a yt-dlp compatible executable.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    program: String,
    timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Vec<u8>> {
        let child = os::background_command(&self.program)
            .args(&args)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let pid = child.id();

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => {
                if let Some(pid) = pid {
                    os::kill_process_tree(pid);
                }
                tracing::error!("{} timed out after {}s, killed", self.program, self.timeout.as_secs());
                return Err(EngineError::TimedOut {
                    tool: self.program.clone(),
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::ExternalToolFailed {
                tool: self.program.clone(),
                code: output.status.code(),
                stderr: stderr.chars().take(400).collect(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl MetadataSource for YtDlpFetcher {
    async fn fetch_document(&self, url: &str, kind: SourceKind, dest: &Path) -> Result<()> {
        let mut args: Vec<String> = vec![
            "--dump-single-json".into(),
            "--no-warnings".into(),
            "--ignore-config".into(),
        ];
        if kind == SourceKind::Playlist {
            args.push("--flat-playlist".into());
        }
        args.push(url.to_string());

        let stdout = self.run(args).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(EngineError::MetadataFetch(format!("{} printed no metadata", self.program)));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, stdout).await?;
        Ok(())
    }

    async fn list_live_from_start_formats(&self, url: &str) -> Result<String> {
        let args = vec![
            "--live-from-start".into(),
            "--list-formats".into(),
            "--no-warnings".into(),
            "--ignore-config".into(),
            url.to_string(),
        ];
        let stdout = self.run(args).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}
