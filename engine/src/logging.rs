//! Process-wide tracing setup: human-readable output on stderr plus an
//! optional daily log file under the app support directory. The file sink can
//! be switched on and off at runtime without reinstalling the subscriber.

use std::fs;
use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, reload, EnvFilter, Registry};

const FILE_PREFIX: &str = "mediagrab.log";
const RETAINED_FILES: usize = 10;

struct FileSink {
    filter: reload::Handle<EnvFilter, Registry>,
    _flush_on_exit: WorkerGuard,
}

static FILE_SINK: OnceCell<FileSink> = OnceCell::new();

fn file_directive(enabled: bool) -> EnvFilter {
    EnvFilter::new(if enabled { "mediagrab_lib=debug,info" } else { "off" })
}

/// Install the global subscriber writing files into `dir`. Only the first
/// call has any effect.
pub fn init(dir: &Path, file_enabled: bool) {
    if FILE_SINK.get().is_some() {
        return;
    }
    if let Err(e) = fs::create_dir_all(dir) {
        eprintln!("log directory {} unavailable: {e}", dir.display());
    }

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, FILE_PREFIX));
    let (filter, handle) = reload::Layer::new(file_directive(file_enabled));

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_line_number(true)
        .with_filter(filter);
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::INFO);

    if tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_err()
    {
        return;
    }
    let _ = FILE_SINK.set(FileSink {
        filter: handle,
        _flush_on_exit: guard,
    });

    prune_old_logs(dir, RETAINED_FILES);
}

/// Turn the log file on or off after `init`.
pub fn set_file_logging_enabled(enabled: bool) {
    if let Some(sink) = FILE_SINK.get() {
        if let Err(e) = sink.filter.reload(file_directive(enabled)) {
            tracing::warn!("could not switch file logging: {e}");
        }
    }
}

/// Remove all but the `keep` most recently modified log files in `dir`.
fn prune_old_logs(dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut logs: Vec<_> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(FILE_PREFIX))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.path()))
        })
        .collect();
    if logs.len() <= keep {
        return;
    }
    logs.sort();
    let excess = logs.len() - keep;
    for (_, path) in logs.into_iter().take(excess) {
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pruning_keeps_the_newest_logs() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=4 {
            let path = dir.path().join(format!("{FILE_PREFIX}.2024-01-0{day}"));
            fs::write(&path, "x").unwrap();
            let at = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(day * 86_400);
            fs::File::options().write(true).open(&path).unwrap().set_modified(at).unwrap();
        }
        fs::write(dir.path().join("other.txt"), "keep").unwrap();

        prune_old_logs(dir.path(), 2);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec!["mediagrab.log.2024-01-03", "mediagrab.log.2024-01-04", "other.txt"]
        );
    }
}
