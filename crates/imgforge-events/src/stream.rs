use std::sync::Arc;
use std::time::Duration;

use imgforge_core::{time::utc_now, BuildContext};
use imgforge_store::BuildStore;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::subscribers::SubscriberRegistry;
use crate::tail::LogTail;

/// Bounded capacity for a subscriber's event channel (spec §4.G). A slow
/// subscriber drops events rather than stalling the producer — the log
/// file and a final metadata read are the reliable paths.
pub const SUBSCRIBER_CAPACITY: usize = 100;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const TERMINAL_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Subscribe to one build's merged log/status/heartbeat feed (spec §4.G).
/// Spawns a detached task that drives the feed and returns the receiving
/// half immediately.
pub fn stream_events(
    store: Arc<BuildStore>,
    registry: Arc<SubscriberRegistry>,
    id: String,
    follow: bool,
    ctx: BuildContext,
) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
    tokio::spawn(run(store, registry, id, follow, ctx, tx));
    rx
}

async fn run(
    store: Arc<BuildStore>,
    registry: Arc<SubscriberRegistry>,
    id: String,
    follow_requested: bool,
    ctx: BuildContext,
    tx: mpsc::Sender<Event>,
) {
    let metadata = match store.read_metadata(&id) {
        Ok(m) => m,
        Err(_) => return,
    };
    // A build that's already terminal has nothing left to follow.
    let follow = follow_requested && !metadata.status.is_terminal();

    let mut status_sub = if follow {
        Some(registry.register(&id, SUBSCRIBER_CAPACITY).await)
    } else {
        None
    };

    let log_path = store.log_path(&id);
    if !log_path.exists() && !follow {
        if let Some((ticket, _)) = status_sub.take() {
            registry.unregister(&id, ticket).await;
        }
        return;
    }

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    let tail = LogTail::spawn(log_path, follow, line_tx);
    let mut tail_done = false;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.reset();

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancelled() => {
                break;
            }

            line = line_rx.recv(), if !tail_done => {
                match line {
                    Some(text) => {
                        if tx.send(Event::Log { line: text, ts: utc_now() }).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tail_done = true;
                        if !follow {
                            break;
                        }
                    }
                }
            }

            _ = heartbeat.tick(), if follow => {
                if tx.send(Event::Heartbeat { ts: utc_now() }).await.is_err() {
                    break;
                }
            }

            event = recv_status(&mut status_sub) => {
                let Some(event) = event else { continue };
                let is_terminal = event.is_terminal_status();
                let _ = tx.send(event).await;
                if is_terminal {
                    tokio::time::sleep(TERMINAL_FLUSH_DELAY).await;
                    break;
                }
            }
        }
    }

    tail.stop().await;
    if let Some((ticket, _)) = status_sub.take() {
        registry.unregister(&id, ticket).await;
    }
}

async fn recv_status(status_sub: &mut Option<(u64, mpsc::Receiver<Event>)>) -> Option<Event> {
    match status_sub {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}
