mod cli;

use std::sync::Arc;

use clap::Parser;
use mediagrab_lib::{
    infer_kind, metadata_cache, settings, CommandSpec, Database, DownloadEvent, DownloadJob,
    DownloadManager, EngineError, JobStatus, MetadataRecord, Result, Settings, SourceKind,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let settings = mediagrab_lib::init();
    if args.debug_logs && !settings.debug_logs {
        mediagrab_lib::logging::set_file_logging_enabled(true);
    }

    if let Err(e) = run(args.command, settings).await {
        tracing::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command, settings: Settings) -> Result<()> {
    match command {
        Command::Metadata { url, kind, refresh } => {
            let kind = kind.map(SourceKind::from).unwrap_or_else(|| infer_kind(&url));
            let record = metadata_cache(&settings).resolve(&url, kind, refresh).await?;
            print_metadata(&record);
            Ok(())
        }
        Command::Download { url, format, kind } => {
            let kind = kind.map(SourceKind::from).unwrap_or_else(|| infer_kind(&url));
            download(&settings, url, format, kind).await
        }
        Command::Resume { job_id } => resume(job_id).await,
        Command::History { paused } => history(paused).await,
    }
}

fn print_metadata(record: &MetadataRecord) {
    println!("{}  [{}]", record.title().unwrap_or("(untitled)"), record.key);
    if let Some(at) = record.expires_at() {
        println!("links valid until {}", at.to_rfc3339());
    }
    if let Some(path) = record.thumbnail_local_path() {
        println!("thumbnail: {path}");
    }
    for f in record.formats() {
        println!("  {:<12} {:<5} {:<12} {:>5}  v:{} a:{}", f.format_id, f.ext, f.resolution, f.fps, f.vcodec, f.acodec);
    }
    let live = record.live_from_start_formats();
    if !live.is_empty() {
        println!("joinable from the start:");
        for f in live {
            println!("  {:<12} {:<5} {:<12} {:>5}  v:{} a:{}", f.format_id, f.ext, f.resolution, f.fps, f.vcodec, f.acodec);
        }
    }
}

fn start_manager() -> (DownloadManager, mpsc::UnboundedReceiver<DownloadEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = DownloadManager::start(
        settings::history_db_path(),
        Arc::new(move |event| {
            let _ = tx.send(event);
        }),
    );
    (manager, rx)
}

async fn download(settings: &Settings, url: String, format_id: String, kind: SourceKind) -> Result<()> {
    let record = metadata_cache(settings).resolve(&url, kind, false).await?;
    let label = record
        .formats()
        .into_iter()
        .chain(record.live_from_start_formats())
        .find(|f| f.format_id == format_id)
        .map(|f| f.format)
        .unwrap_or_else(|| format_id.clone());

    let id = Uuid::new_v4().to_string();
    let mut job = DownloadJob::new(&id, record.title().unwrap_or(url.as_str()), label, &url, kind);
    job.thumbnail_url = record.thumbnail_url().map(str::to_string);
    job.thumbnail_local_path = record.thumbnail_local_path().map(str::to_string);

    let command = CommandSpec::new(
        settings.downloader_path.clone(),
        vec![
            "-f".into(),
            format_id,
            "--newline".into(),
            "-P".into(),
            settings.download_directory.clone(),
            url,
        ],
    );

    let (manager, events) = start_manager();
    manager.submit(job, command).await?;
    watch(&manager, &id, events).await
}

async fn resume(job_id: String) -> Result<()> {
    let db_path = settings::history_db_path();
    let lookup = job_id.clone();
    let found = tokio::task::spawn_blocking(move || Database::open(&db_path)?.find_job(&lookup)).await??;
    let Some(job) = found else {
        println!("no recorded download with id {job_id}");
        return Ok(());
    };
    if job.status != JobStatus::Paused {
        println!("{} is {}, only paused downloads can be resumed", job.id, job.status.as_str());
        return Ok(());
    }

    let (manager, events) = start_manager();
    manager.resume(job).await?;
    watch(&manager, &job_id, events).await
}

/// Print progress for `id` until it reaches a terminal state. Ctrl-C pauses
/// every running download first.
async fn watch(
    manager: &DownloadManager,
    id: &str,
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
) -> Result<()> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("\npausing...");
                manager.pause_all().await?;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(EngineError::ManagerClosed);
                };
                if event.job_id() != Some(id) {
                    continue;
                }
                match event {
                    DownloadEvent::Progress { progress_text, .. } => println!("{progress_text}"),
                    DownloadEvent::StatusChanged { status, .. } if status.is_terminal() => {
                        match status {
                            JobStatus::Paused => println!("paused; continue with `mediagrab resume {id}`"),
                            JobStatus::Completed => println!("done"),
                            _ => println!("failed"),
                        }
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn history(paused_only: bool) -> Result<()> {
    let db_path = settings::history_db_path();
    let jobs = tokio::task::spawn_blocking(move || {
        let db = Database::open(&db_path)?;
        if paused_only {
            db.list_jobs_with_status(JobStatus::Paused)
        } else {
            db.list_jobs()
        }
    })
    .await??;
    if jobs.is_empty() {
        println!("no downloads recorded");
    }
    for job in jobs {
        println!(
            "{}  {:<10} {:>5.1}%  {}  [{}]",
            job.id,
            job.status.as_str(),
            job.progress_percent,
            job.title,
            job.format
        );
        if job.status == JobStatus::Failed && !job.progress_text.is_empty() {
            println!("    {}", job.progress_text);
        }
    }
    Ok(())
}
