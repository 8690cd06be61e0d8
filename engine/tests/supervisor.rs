#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mediagrab_lib::{
    CommandSpec, Database, DownloadEvent, DownloadJob, DownloadManager, EngineError, JobStatus,
    SourceKind,
};
use tokio::sync::mpsc;

struct Harness {
    manager: DownloadManager,
    events: mpsc::UnboundedReceiver<DownloadEvent>,
    db_path: PathBuf,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("history.db");
    let (tx, events) = mpsc::unbounded_channel();
    let manager = DownloadManager::start(
        db_path.clone(),
        Arc::new(move |ev| {
            let _ = tx.send(ev);
        }),
    );
    Harness { manager, events, db_path, _dir: dir }
}

fn job(id: &str) -> DownloadJob {
    DownloadJob::new(id, "Test clip", "18 - 360p", "https://example.com/v/1", SourceKind::Generic)
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", vec!["-c".into(), script.into()])
}

/// Collect events for `id` until it reports `status`.
async fn until_status(h: &mut Harness, id: &str, status: JobStatus) -> Vec<DownloadEvent> {
    let mut seen = Vec::new();
    let wait = async {
        while let Some(ev) = h.events.recv().await {
            if ev.job_id() != Some(id) {
                continue;
            }
            let done = matches!(&ev, DownloadEvent::StatusChanged { status: s, .. } if *s == status);
            seen.push(ev);
            if done {
                return;
            }
        }
    };
    let reached = tokio::time::timeout(Duration::from_secs(10), wait).await.is_ok();
    assert!(reached, "{id} never reached {status:?}; saw {seen:?}");
    seen
}

async fn first_progress(h: &mut Harness, id: &str) {
    let wait = async {
        while let Some(ev) = h.events.recv().await {
            if matches!(&ev, DownloadEvent::Progress { id: i, .. } if i == id) {
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait).await.unwrap();
}

fn stored(h: &Harness, id: &str) -> Option<DownloadJob> {
    Database::open(&h.db_path).unwrap().find_job(id).unwrap()
}

fn progress_of(events: &[DownloadEvent]) -> Vec<(String, Option<f32>)> {
    events
        .iter()
        .filter_map(|ev| match ev {
            DownloadEvent::Progress { progress_text, progress_percent, .. } => {
                Some((progress_text.clone(), *progress_percent))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn completed_download_reports_progress_then_completion() {
    let mut h = harness();
    h.manager
        .submit(
            job("a"),
            sh("echo '[download]  10.0% of 1.00MiB'; echo '[download]  55.5% of 1.00MiB'; echo 'Merging formats'"),
        )
        .await
        .unwrap();

    let events = until_status(&mut h, "a", JobStatus::Completed).await;
    assert_eq!(
        events.first(),
        Some(&DownloadEvent::StatusChanged { id: "a".into(), status: JobStatus::Downloading })
    );
    assert_eq!(
        progress_of(&events),
        vec![
            ("[download]  10.0% of 1.00MiB".to_string(), Some(10.0)),
            ("[download]  55.5% of 1.00MiB".to_string(), Some(55.5)),
            ("Merging formats".to_string(), None),
        ]
    );

    let rec = stored(&h, "a").unwrap();
    assert_eq!(rec.status, JobStatus::Completed);
    assert_eq!(rec.progress_percent, 100.0);
    assert!(rec.completed_at.is_some());
    assert!(h.manager.list_running().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_download_keeps_last_stderr_line_as_context() {
    let mut h = harness();
    h.manager
        .submit(job("b"), sh("echo '[download]  20.0% of 3MiB'; sleep 0.2; echo 'ERROR: HTTP Error 403' >&2; exit 2"))
        .await
        .unwrap();

    let events = until_status(&mut h, "b", JobStatus::Failed).await;
    let progress = progress_of(&events);
    assert_eq!(progress.last(), Some(&("ERROR: HTTP Error 403".to_string(), None)));

    let rec = stored(&h, "b").unwrap();
    assert_eq!(rec.status, JobStatus::Failed);
    assert_eq!(rec.progress_text, "Download failed: ERROR: HTTP Error 403");
    assert_eq!(rec.progress_percent, 20.0);
    assert!(rec.completed_at.is_none());
}

#[tokio::test]
async fn stderr_percent_only_updates_the_text() {
    let mut h = harness();
    h.manager
        .submit(
            job("s"),
            sh("echo '   [download]  30.0% of 2MiB'; sleep 0.2; echo 'WARNING: retry 80%' >&2; sleep 0.2; exit 1"),
        )
        .await
        .unwrap();

    let events = until_status(&mut h, "s", JobStatus::Failed).await;
    assert_eq!(
        progress_of(&events),
        vec![
            ("   [download]  30.0% of 2MiB".to_string(), Some(30.0)),
            ("WARNING: retry 80%".to_string(), None),
        ]
    );

    let rec = stored(&h, "s").unwrap();
    assert_eq!(rec.progress_percent, 30.0);
    assert_eq!(rec.progress_text, "Download failed: WARNING: retry 80%");
}

/// The shell exits 0 right away while a grandchild in its own session keeps
/// the output pipes open, so the exit is only reported after the pause has
/// already been requested.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn pause_racing_a_clean_exit_leaves_the_job_completed() {
    let mut h = harness();
    h.manager
        .submit(job("r"), sh("setsid sleep 1 & echo '[download] 100% of 1MiB'; exit 0"))
        .await
        .unwrap();
    first_progress(&mut h, "r").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    h.manager.pause("r").await.unwrap();

    let events = until_status(&mut h, "r", JobStatus::Completed).await;
    assert!(!events
        .iter()
        .any(|ev| matches!(ev, DownloadEvent::StatusChanged { status: JobStatus::Paused, .. })));
    let rec = stored(&h, "r").unwrap();
    assert_eq!(rec.status, JobStatus::Completed);
    assert_eq!(rec.progress_text, "Download completed");
}

#[tokio::test]
async fn paused_download_resumes_without_duplicate_history() {
    let mut h = harness();
    let script = "echo '[download]   5.0% of 9MiB'; sleep 30";
    h.manager.submit(job("c"), sh(script)).await.unwrap();
    first_progress(&mut h, "c").await;

    h.manager.pause("c").await.unwrap();
    until_status(&mut h, "c", JobStatus::Paused).await;

    let paused = stored(&h, "c").unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.progress_text, "Download paused");
    assert_eq!(paused.command_base, "sh");
    assert_eq!(paused.command_args, vec!["-c".to_string(), script.to_string()]);

    h.manager.resume(paused).await.unwrap();
    assert!(stored(&h, "c").is_none());
    let running = h.manager.list_running().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].status, JobStatus::Downloading);
    assert_eq!(running[0].command_args[1], script);

    h.manager.pause("c").await.unwrap();
    until_status(&mut h, "c", JobStatus::Paused).await;
    let all = Database::open(&h.db_path).unwrap().list_jobs().unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn pausing_an_unknown_job_is_an_error() {
    let h = harness();
    let err = h.manager.pause("nope").await.unwrap_err();
    assert!(matches!(err, EngineError::JobNotRunning(id) if id == "nope"));
}

#[tokio::test]
async fn pause_all_with_nothing_running_returns_immediately() {
    let h = harness();
    tokio::time::timeout(Duration::from_secs(2), h.manager.pause_all())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn pause_all_waits_for_every_process() {
    let h = harness();
    for id in ["d1", "d2", "d3"] {
        h.manager.submit(job(id), sh("echo started; sleep 30")).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), h.manager.pause_all())
        .await
        .unwrap()
        .unwrap();

    assert!(h.manager.list_running().await.unwrap().is_empty());
    for id in ["d1", "d2", "d3"] {
        assert_eq!(stored(&h, id).unwrap().status, JobStatus::Paused);
    }
}

#[tokio::test]
async fn duplicate_submit_is_rejected() {
    let h = harness();
    h.manager.submit(job("e"), sh("sleep 30")).await.unwrap();
    let err = h.manager.submit(job("e"), sh("sleep 30")).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning(_)));
    h.manager.pause_all().await.unwrap();
}

#[tokio::test]
async fn spawn_failure_never_registers_the_job() {
    let h = harness();
    let err = h
        .manager
        .submit(job("f"), CommandSpec::new("/nonexistent/downloader", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Spawn { .. }));
    assert!(h.manager.list_running().await.unwrap().is_empty());
    assert!(h.manager.pause("f").await.is_err());
}
