//! Human-readable rendering for the CLI, grounded in `mvm-cli`'s
//! `display.rs` but using plain column formatting plus `colored` for
//! status highlighting rather than a table-drawing crate, since `tabled`
//! is not part of this stack's dependency set.

use colored::Colorize;
use imgforge_core::{Build, BuildStatus};

fn colorize_status(status: BuildStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        BuildStatus::Ready => text.green(),
        BuildStatus::Failed => text.red(),
        BuildStatus::Cancelled => text.yellow(),
        BuildStatus::Building | BuildStatus::Pushing => text.cyan(),
        BuildStatus::Queued => text.normal(),
    }
}

pub fn print_build(build: &Build) {
    println!("{:<16} {}", "id:", build.id);
    println!("{:<16} {}", "status:", colorize_status(build.status));
    if let Some(position) = build.queue_position {
        println!("{:<16} {}", "queue position:", position);
    }
    println!("{:<16} {}", "created:", build.created_at);
    if let Some(started) = &build.started_at {
        println!("{:<16} {}", "started:", started);
    }
    if let Some(completed) = &build.completed_at {
        println!("{:<16} {}", "completed:", completed);
    }
    if let Some(ms) = build.duration_ms {
        println!("{:<16} {ms}ms", "duration:");
    }
    if let Some(digest) = &build.image_digest {
        println!("{:<16} {}", "image digest:", digest);
    }
    if let Some(image_ref) = &build.image_ref {
        println!("{:<16} {}", "image ref:", image_ref);
    }
    if let Some(error) = &build.error {
        println!("{:<16} {}", "error:", error.red());
    }
}

pub fn print_build_table(builds: &[Build]) {
    if builds.is_empty() {
        println!("no builds");
        return;
    }
    println!("{:<20} {:<12} {:<10} {:<24}", "ID", "STATUS", "QUEUE POS", "CREATED");
    for build in builds {
        let position = build
            .queue_position
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<12} {:<10} {:<24}",
            build.id,
            colorize_status(build.status),
            position,
            build.created_at
        );
    }
}
