//! Command handlers for tubectl.

use anyhow::{bail, Result};
use owo_colors::OwoColorize;
use tube_common::{PracticeSession, RotationView};

use crate::display;

/// Handle status command
pub fn status(session: &PracticeSession) -> Result<()> {
    if let Some(identity) = session.identity() {
        let kind = if identity.anonymous { " (anonymous)" } else { "" };
        println!("{}{}", identity.user_id.bold(), kind.dimmed());
        println!();
    }
    print!("{}", display::render_rotation(&session.view()));
    println!();
    print!("{}", display::render_sync(&session.sync_status()));
    Ok(())
}

/// Record a finished unit on a tube. Defaults to the active tube.
pub fn complete(session: &PracticeSession, slot: Option<u8>, correct: u32, total: u32) -> Result<()> {
    if correct > total {
        bail!("correct ({}) cannot exceed total ({})", correct, total);
    }
    let slot = slot.unwrap_or_else(|| session.state().active_slot.get());
    let event = session.completion_for(slot, correct, total)?;
    let unit_id = event.unit_id.clone();
    let perfect = event.is_perfect();
    let before = session.state().points.session;

    let state = session.complete(event)?;
    let earned = state.points.session.saturating_sub(before);

    let verdict = if perfect {
        "perfect".green().to_string()
    } else {
        "kept in place".yellow().to_string()
    };
    println!(
        "{} {}/{} on {} {} (+{} points)",
        "✓".green(),
        correct,
        total,
        unit_id,
        verdict,
        earned
    );

    let view = RotationView::from_state(&state);
    if let Some(next) = view.ready_stitch(slot) {
        println!("  next on tube {}: {}", slot, next.id);
    }
    Ok(())
}

/// Move to a given tube, or to the next one in order
pub fn rotate(session: &PracticeSession, to: Option<u8>) -> Result<()> {
    let state = match to {
        Some(slot) => session.cycle_to(slot)?,
        None => session.advance()?,
    };
    println!(
        "{} active tube {} (cycle {})",
        "→".cyan(),
        state.active_slot,
        state.cycle_count
    );
    Ok(())
}

pub async fn sync(session: &PracticeSession) -> Result<()> {
    let ok = session.force_sync().await;
    if ok {
        println!("{} state saved", "✓".green());
    } else {
        println!("{} sync failed, changes stay queued locally", "✗".red());
    }
    print!("{}", display::render_sync(&session.sync_status()));
    Ok(())
}

pub fn view(session: &PracticeSession, json: bool) -> Result<()> {
    let view = session.view();
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print!("{}", display::render_rotation(&view));
    }
    Ok(())
}

/// Show cache status, optionally waiting for the prefetch of every tube
pub async fn cache(session: &PracticeSession, prefetch: bool) -> Result<()> {
    if prefetch {
        let state = session.state();
        if let Some(handle) = session
            .cache()
            .prefetch_for_state(&state, &session.config().progression)
        {
            handle.await?;
        }
    }
    print!("{}", display::render_cache(&session.cache().cache_status()));
    Ok(())
}

/// Print the content of the ready stitch on a tube
pub async fn show(session: &PracticeSession, slot: Option<u8>) -> Result<()> {
    let view = session.view();
    let slot = slot.unwrap_or(view.active_tube);
    let Some(ready) = view.ready_stitch(slot) else {
        bail!("tube {} has no ready stitch", slot);
    };
    let stitch = session.content(&ready.id).await?;
    print!("{}", display::render_stitch(&stitch));
    Ok(())
}
