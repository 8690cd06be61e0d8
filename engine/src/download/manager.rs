use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::database::{Database, DownloadJob, JobStatus};
use crate::download::process::{self, CommandSpec, OutputStream, ProcessControl, ProcessEvent};
use crate::download::progress::parse_progress_percentage;
use crate::error::{EngineError, Result};

pub const COMPLETED_MESSAGE: &str = "Download completed";
pub const FAILED_MESSAGE: &str = "Download failed";
pub const PAUSED_MESSAGE: &str = "Download paused";

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type")]
pub enum DownloadEvent {
    StatusChanged {
        id: String,
        status: JobStatus,
    },
    Progress {
        id: String,
        progress_text: String,
        progress_percent: Option<f32>,
    },
    /// The running set or the history changed; listings should be refreshed.
    DownloadsChanged,
}

impl DownloadEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            DownloadEvent::StatusChanged { id, .. } | DownloadEvent::Progress { id, .. } => Some(id),
            DownloadEvent::DownloadsChanged => None,
        }
    }
}

pub type Emitter = Arc<dyn Fn(DownloadEvent) + Send + Sync>;

enum DownloadCommand {
    Submit {
        job: DownloadJob,
        command: CommandSpec,
        replaces_history: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    PauseAll {
        reply: oneshot::Sender<()>,
    },
    ListRunning {
        reply: oneshot::Sender<Vec<DownloadJob>>,
    },
}

struct ProcessMessage {
    id: String,
    run: u64,
    event: ProcessEvent,
}

/// Cloneable handle to the download supervisor task.
#[derive(Clone)]
pub struct DownloadManager {
    cmd_tx: mpsc::UnboundedSender<DownloadCommand>,
}

impl fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadManager").finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Start the supervisor on the current tokio runtime. Terminal jobs are
    /// written to the history database at `db_path`.
    pub fn start(db_path: PathBuf, emitter: Emitter) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_download_manager(db_path, emitter, cmd_rx));
        Self { cmd_tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> DownloadCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .map_err(|_| EngineError::ManagerClosed)?;
        rx.await.map_err(|_| EngineError::ManagerClosed)
    }

    /// Spawn the downloader for `job`. Returns once the process is running; a
    /// spawn failure is returned here and the job never becomes running.
    pub async fn submit(&self, job: DownloadJob, command: CommandSpec) -> Result<()> {
        self.request(|reply| DownloadCommand::Submit {
            job,
            command,
            replaces_history: false,
            reply,
        })
        .await?
    }

    /// Stop a running job. It is recorded as paused, never as failed.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| DownloadCommand::Pause { id, reply }).await?
    }

    /// Start a previously paused job again from its stored command. Its old
    /// history record is dropped once the new process is running.
    pub async fn resume(&self, mut job: DownloadJob) -> Result<()> {
        let command = CommandSpec::new(job.command_base.clone(), job.command_args.clone());
        job.progress_text.clear();
        job.completed_at = None;
        self.request(|reply| DownloadCommand::Submit {
            job,
            command,
            replaces_history: true,
            reply,
        })
        .await?
    }

    /// Pause every running job and wait until each process has exited.
    pub async fn pause_all(&self) -> Result<()> {
        self.request(|reply| DownloadCommand::PauseAll { reply }).await
    }

    pub async fn list_running(&self) -> Result<Vec<DownloadJob>> {
        self.request(|reply| DownloadCommand::ListRunning { reply }).await
    }
}

struct ActiveJob {
    job: DownloadJob,
    control: ProcessControl,
    run: u64,
    pause_requested: bool,
}

struct Supervisor {
    db_path: PathBuf,
    emitter: Emitter,
    proc_tx: mpsc::UnboundedSender<ProcessMessage>,
    running: HashMap<String, ActiveJob>,
    shutdown_waiters: Vec<(HashSet<String>, oneshot::Sender<()>)>,
    next_run: u64,
}

async fn run_download_manager(
    db_path: PathBuf,
    emitter: Emitter,
    mut cmd_rx: mpsc::UnboundedReceiver<DownloadCommand>,
) {
    let (proc_tx, mut proc_rx) = mpsc::unbounded_channel();
    let mut sup = Supervisor {
        db_path,
        emitter,
        proc_tx,
        running: HashMap::new(),
        shutdown_waiters: Vec::new(),
        next_run: 0,
    };
    let mut commands_open = true;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if commands_open => match cmd {
                Some(cmd) => sup.handle_command(cmd).await,
                None => commands_open = false,
            },
            Some(msg) = proc_rx.recv() => sup.handle_process(msg).await,
        }
        if !commands_open && sup.running.is_empty() {
            break;
        }
    }
    tracing::debug!("download manager stopped");
}

impl Supervisor {
    async fn handle_command(&mut self, cmd: DownloadCommand) {
        match cmd {
            DownloadCommand::Submit {
                job,
                command,
                replaces_history,
                reply,
            } => {
                let res = self.spawn_job(job, command, replaces_history).await;
                let _ = reply.send(res);
            }
            DownloadCommand::Pause { id, reply } => {
                let _ = reply.send(self.request_pause(&id));
            }
            DownloadCommand::PauseAll { reply } => {
                let ids: HashSet<String> = self.running.keys().cloned().collect();
                if ids.is_empty() {
                    let _ = reply.send(());
                    return;
                }
                tracing::info!("pausing {} running download(s)", ids.len());
                for id in &ids {
                    let _ = self.request_pause(id);
                }
                self.shutdown_waiters.push((ids, reply));
            }
            DownloadCommand::ListRunning { reply } => {
                let jobs = self.running.values().map(|a| a.job.clone()).collect();
                let _ = reply.send(jobs);
            }
        }
    }

    async fn spawn_job(&mut self, mut job: DownloadJob, command: CommandSpec, replaces_history: bool) -> Result<()> {
        if self.running.contains_key(&job.id) {
            return Err(EngineError::AlreadyRunning(job.id));
        }

        self.next_run += 1;
        let run = self.next_run;
        let id = job.id.clone();
        let tx = self.proc_tx.clone();
        let control = process::spawn_process(&command, move |event| {
            let _ = tx.send(ProcessMessage {
                id: id.clone(),
                run,
                event,
            });
        })?;

        tracing::info!(
            "started download {} ({}) pid={:?}: {} {:?}",
            job.id,
            job.format,
            control.pid(),
            command.base,
            command.args
        );

        job.command_base = command.base;
        job.command_args = command.args;
        job.status = JobStatus::Downloading;
        job.completed_at = None;

        if replaces_history {
            let id = job.id.clone();
            if let Err(e) = self.with_db(move |db| db.delete_job(&id).map(|_| ())).await {
                tracing::warn!("could not drop history record of resumed job {}: {e}", job.id);
            }
        }

        let id = job.id.clone();
        self.running.insert(
            id.clone(),
            ActiveJob {
                job,
                control,
                run,
                pause_requested: false,
            },
        );
        self.emit(DownloadEvent::StatusChanged {
            id,
            status: JobStatus::Downloading,
        });
        self.emit(DownloadEvent::DownloadsChanged);
        Ok(())
    }

    fn request_pause(&mut self, id: &str) -> Result<()> {
        let Some(active) = self.running.get_mut(id) else {
            tracing::warn!("pause requested for unknown download {id}");
            return Err(EngineError::JobNotRunning(id.to_string()));
        };
        active.pause_requested = true;
        active.control.terminate();
        tracing::info!("pause requested for download {id}");
        Ok(())
    }

    async fn handle_process(&mut self, msg: ProcessMessage) {
        let ProcessMessage { id, run, event } = msg;
        match self.running.get(&id) {
            Some(active) if active.run == run => {}
            _ => {
                tracing::debug!("dropping event for stale run {run} of {id}");
                return;
            }
        }

        match event {
            ProcessEvent::Line { stream, line } => self.on_line(&id, stream, line),
            ProcessEvent::Exited { code } => self.on_exit(&id, code).await,
        }
    }

    fn on_line(&mut self, id: &str, stream: OutputStream, line: String) {
        let Some(active) = self.running.get_mut(id) else {
            return;
        };
        let percent = match stream {
            OutputStream::Stdout => parse_progress_percentage(&line),
            OutputStream::Stderr => None,
        };
        if let Some(p) = percent {
            active.job.progress_percent = p;
        }
        active.job.progress_text = line.clone();
        self.emit(DownloadEvent::Progress {
            id: id.to_string(),
            progress_text: line,
            progress_percent: percent,
        });
    }

    async fn on_exit(&mut self, id: &str, code: Option<i32>) {
        let Some(active) = self.running.remove(id) else {
            return;
        };
        let mut job = active.job;

        job.status = exit_status(code, active.pause_requested);
        match job.status {
            JobStatus::Completed => {
                job.completed_at = Some(Utc::now());
                job.progress_percent = 100.0;
                job.progress_text = COMPLETED_MESSAGE.to_string();
            }
            JobStatus::Paused => {
                job.completed_at = None;
                job.progress_text = PAUSED_MESSAGE.to_string();
            }
            _ => {
                job.completed_at = None;
                job.progress_text = failure_message(&job.progress_text);
            }
        }
        tracing::info!("download {id} finished as {} (code={code:?})", job.status.as_str());

        let status = job.status;
        let record = job.clone();
        if let Err(e) = self.with_db(move |db| db.insert_job(&record)).await {
            tracing::error!("could not persist download {id}: {e}");
        }

        self.emit(DownloadEvent::StatusChanged {
            id: id.to_string(),
            status,
        });
        self.emit(DownloadEvent::DownloadsChanged);

        for (pending, _) in self.shutdown_waiters.iter_mut() {
            pending.remove(id);
        }
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.shutdown_waiters)
            .into_iter()
            .partition(|(pending, _)| pending.is_empty());
        self.shutdown_waiters = waiting;
        for (_, reply) in done {
            let _ = reply.send(());
        }
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let db = Database::open(&path)?;
            f(&db)
        })
        .await?
        .map_err(EngineError::from)
    }

    fn emit(&self, event: DownloadEvent) {
        tracing::trace!("[DownloadEvent] {:?}", event);
        (self.emitter)(event);
    }
}

/// Terminal state of a run. A killed process never exits with 0, so a clean
/// exit that raced a pause request still counts as completed.
fn exit_status(code: Option<i32>, pause_requested: bool) -> JobStatus {
    match code {
        Some(0) => JobStatus::Completed,
        _ if pause_requested => JobStatus::Paused,
        _ => JobStatus::Failed,
    }
}

fn failure_message(last_line: &str) -> String {
    if last_line.is_empty() {
        FAILED_MESSAGE.to_string()
    } else {
        format!("{FAILED_MESSAGE}: {last_line}")
    }
}
