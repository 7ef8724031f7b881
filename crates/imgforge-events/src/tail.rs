use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

/// Poll interval used both as the native-event fallback and as the
/// maximum time [`LogTail::stop`] needs to wait for a clean shutdown
/// (spec §9 "Tail of a log file").
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Line-oriented tail of a single file. Avoids shelling out to `tail`:
/// reads existing lines up front, then (if `follow`) watches the parent
/// directory with `notify` (inotify/kqueue, falling back to polling) for
/// further writes. Bounded-latency, leak-free shutdown: [`LogTail::stop`]
/// sets a flag the blocking thread checks at least once per
/// [`POLL_INTERVAL`] and then joins it, so the reader is always
/// terminable without leaking a thread or file handle.
pub struct LogTail {
    stop_flag: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl LogTail {
    pub fn spawn(path: PathBuf, follow: bool, tx: mpsc::Sender<String>) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let task_stop_flag = stop_flag.clone();
        let handle = tokio::task::spawn_blocking(move || tail_blocking(path, follow, tx, task_stop_flag));
        Self { stop_flag, handle }
    }

    /// Signal the tail to stop and wait for the blocking thread to exit.
    pub async fn stop(self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let _ = self.handle.await;
    }
}

fn tail_blocking(path: PathBuf, follow: bool, tx: mpsc::Sender<String>, stop_flag: Arc<AtomicBool>) {
    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(_) => return,
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    if !drain(&mut reader, &mut line, &tx) || !follow {
        return;
    }

    let (watch_tx, watch_rx) = std::sync::mpsc::channel();
    let mut watcher = match notify::recommended_watcher(watch_tx) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "log tail: failed to start filesystem watcher, relying on polling alone");
            loop {
                if stop_flag.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
                if !drain(&mut reader, &mut line, &tx) {
                    return;
                }
            }
        }
    };
    let watch_dir = path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    if watcher.watch(&watch_dir, RecursiveMode::NonRecursive).is_err() {
        return;
    }

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return;
        }
        match watch_rx.recv_timeout(POLL_INTERVAL) {
            Ok(_) | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if !drain(&mut reader, &mut line, &tx) {
                    return;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Read every complete line currently available and send it. Returns
/// `false` if the receiver has gone away (no point reading further).
fn drain(reader: &mut BufReader<std::fs::File>, line: &mut String, tx: &mpsc::Sender<String>) -> bool {
    loop {
        line.clear();
        match reader.read_line(line) {
            Ok(0) => return true,
            Ok(_) => {
                let text = line.trim_end_matches('\n').to_string();
                if tx.blocking_send(text).is_err() {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
}
