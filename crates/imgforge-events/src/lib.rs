//! imgforge-events: merged log-tail and status-broadcast feed for one
//! build's observers (spec §4.G).
//!
//! A subscriber sees, in order: existing log lines, then (if following)
//! live log lines interleaved with status changes and periodic heartbeats,
//! until a terminal status closes the stream. The feed is best-effort —
//! the subscriber registry drops events for a slow consumer rather than
//! block the writer — so a client that needs a guaranteed final state
//! should always re-`get` the build after the stream closes.

mod event;
mod stream;
mod subscribers;
mod tail;

pub use event::Event;
pub use stream::{stream_events, SUBSCRIBER_CAPACITY};
pub use subscribers::SubscriberRegistry;
