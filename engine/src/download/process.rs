use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};
use crate::utils::os;

/// Exact downloader invocation for a job. Opaque to the engine: it is only
/// spawned and, for resume, replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub base: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(base: impl Into<String>, args: Vec<String>) -> Self {
        Self { base: base.into(), args }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Line { stream: OutputStream, line: String },
    /// Always the last event of a process. `None` when killed by a signal or unwaitable.
    Exited { code: Option<i32> },
}

/// Handle to a spawned child kept in the running registry.
pub struct ProcessControl {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the watcher to kill the process tree. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn `spec` and stream its output lines, then its exit, into `on_event`.
/// Spawn failures are returned here and no event is ever emitted for them.
pub fn spawn_process<F>(spec: &CommandSpec, mut on_event: F) -> Result<ProcessControl>
where
    F: FnMut(ProcessEvent) + Send + 'static,
{
    let mut child = os::background_command(&spec.base)
        .args(&spec.args)
        .spawn()
        .map_err(|source| EngineError::Spawn {
            program: spec.base.clone(),
            source,
        })?;

    let pid = child.id();
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    tokio::spawn(async move {
        let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
        let mut err_lines = stderr.map(|s| BufReader::new(s).lines());
        let mut out_done = out_lines.is_none();
        let mut err_done = err_lines.is_none();
        let mut kill_seen = false;

        let code = loop {
            tokio::select! {
                biased;
                res = &mut kill_rx, if !kill_seen => {
                    kill_seen = true;
                    // A dropped sender only means nobody can pause us any more.
                    if res.is_ok() {
                        if let Some(pid) = pid {
                            os::kill_process_tree(pid);
                        }
                    }
                }
                line = next_line(&mut out_lines), if !out_done => match line {
                    Some(l) => emit_line(&mut on_event, OutputStream::Stdout, l),
                    None => out_done = true,
                },
                line = next_line(&mut err_lines), if !err_done => match line {
                    Some(l) => emit_line(&mut on_event, OutputStream::Stderr, l),
                    None => err_done = true,
                },
                status = child.wait(), if out_done && err_done => {
                    break match status {
                        Ok(s) => s.code(),
                        Err(e) => {
                            tracing::warn!("waiting on pid {:?} failed: {e}", pid);
                            None
                        }
                    };
                }
            }
        };

        on_event(ProcessEvent::Exited { code });
    });

    Ok(ProcessControl {
        pid,
        kill_tx: Some(kill_tx),
    })
}

type Lines<R> = tokio::io::Lines<BufReader<R>>;

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines.as_mut() {
        Some(l) => match l.next_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("output stream closed with error: {e}");
                None
            }
        },
        None => None,
    }
}

fn emit_line<F>(on_event: &mut F, stream: OutputStream, raw: String)
where
    F: FnMut(ProcessEvent),
{
    let line = raw.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return;
    }
    on_event(ProcessEvent::Line {
        stream,
        line: line.to_string(),
    });
}
