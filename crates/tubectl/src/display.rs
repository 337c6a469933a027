//! Terminal rendering for rotation and sync status.

use chrono::{Local, TimeZone};
use owo_colors::OwoColorize;
use tube_common::content::CacheStatus;
use tube_common::persistence::{SyncPhase, SyncStatus};
use tube_common::{RotationView, StitchContent};

const KEY_WIDTH: usize = 16;
const HR: &str = "────────────────────────────────────────";

fn kv(key: &str, value: impl std::fmt::Display) -> String {
    format!("{:width$} {}\n", key, value, width = KEY_WIDTH)
}

/// Epoch millis as local wall time, "never" when absent
pub fn format_millis(millis: Option<i64>) -> String {
    match millis.and_then(|m| Local.timestamp_millis_opt(m).single()) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "never".to_string(),
    }
}

/// The three tubes with their ready stitch, active tube marked
pub fn render_rotation(view: &RotationView) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "Rotation".bold()));
    out.push_str(&format!("{}\n", HR.dimmed()));
    out.push_str(&kv("cycle", view.cycle_count));
    out.push_str(&kv(
        "points",
        format!("{} session / {} lifetime", view.points.session, view.points.lifetime),
    ));
    out.push('\n');

    for (number, tube) in &view.tubes {
        let marker = if *number == view.active_tube { "▶" } else { " " };
        let ready = view.ready_stitch(*number);
        let detail = match ready {
            Some(s) => format!("skip {} · {}", s.skip_number, s.distractor_level),
            None => "no ready stitch".to_string(),
        };
        let line = format!(
            "{} tube {}  {:<10} {:<12} {}",
            marker, number, tube.thread_id, tube.current_stitch_id, detail
        );
        if *number == view.active_tube {
            out.push_str(&format!("{}\n", line.green()));
        } else {
            out.push_str(&format!("{}\n", line));
        }
    }
    out
}

pub fn render_sync(status: &SyncStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "Sync".bold()));
    out.push_str(&format!("{}\n", HR.dimmed()));
    out.push_str(&kv("user", status.user_id.as_deref().unwrap_or("-")));

    let phase = match status.phase {
        SyncPhase::Idle => status.phase.to_string().green().to_string(),
        _ => status.phase.to_string().yellow().to_string(),
    };
    out.push_str(&kv("phase", phase));

    let remote = if status.remote_enabled { "enabled" } else { "local only" };
    out.push_str(&kv("remote", remote));
    out.push_str(&kv("last success", format_millis(status.last_success)));
    if let Some(reason) = &status.last_failure {
        out.push_str(&kv(
            "last failure",
            format!("{} ({})", reason.red(), format_millis(status.last_failure_at)),
        ));
    }
    if status.consecutive_failures > 0 {
        out.push_str(&kv("failures", status.consecutive_failures.red()));
    }
    out.push_str(&kv("queued", status.queued_replays));
    out.push_str(&kv("remote calls", status.remote_calls));
    out
}

pub fn render_cache(status: &CacheStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "Content cache".bold()));
    out.push_str(&format!("{}\n", HR.dimmed()));
    out.push_str(&kv("entries", format!("{} / {}", status.entries, status.max_entries)));
    out.push_str(&kv("hits", status.hits));
    out.push_str(&kv("misses", status.misses));
    out.push_str(&kv("worker", if status.worker_enabled { "on" } else { "off" }));
    if status.worker_fallbacks > 0 {
        out.push_str(&kv("fallbacks", status.worker_fallbacks.yellow()));
    }
    out
}

pub fn render_stitch(stitch: &StitchContent) -> String {
    let mut out = String::new();
    let title = stitch.title.as_deref().unwrap_or(&stitch.id);
    out.push_str(&format!("{} {}\n", title.bold(), format!("({})", stitch.id).dimmed()));
    for (i, question) in stitch.questions.iter().enumerate() {
        let prompt = question
            .get("prompt")
            .and_then(|p| p.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| question.to_string());
        out.push_str(&format!("  {:>2}. {}\n", i + 1, prompt));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tube_common::{LearningState, RotationView};

    #[test]
    fn test_format_millis_never() {
        assert_eq!(format_millis(None), "never");
    }

    #[test]
    fn test_rotation_lists_every_tube() {
        let threads = vec!["t1".to_string(), "t2".to_string(), "t3".to_string()];
        let state = LearningState::with_threads("u", &threads, 4, 3);
        let out = render_rotation(&RotationView::from_state(&state));
        assert!(out.contains("tube 1"));
        assert!(out.contains("tube 3"));
        assert!(out.contains("t2-0001"));
    }
}
