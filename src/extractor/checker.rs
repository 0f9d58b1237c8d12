//! Extraction trigger checkers

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::ExtractionContext;

/// Decides whether an extraction should run for the given context
pub type Checker = Arc<dyn Fn(&ExtractionContext<'_>) -> bool + Send + Sync>;

/// Passes once at least `min_messages` are pending
pub fn check_message_threshold(min_messages: usize) -> Checker {
    Arc::new(move |ctx: &ExtractionContext<'_>| ctx.messages.len() >= min_messages)
}

/// Passes on every `every`-th turn. `0` behaves like `1`.
pub fn check_turn_interval(every: u64) -> Checker {
    let every = every.max(1);
    Arc::new(move |ctx: &ExtractionContext<'_>| ctx.total_turns > 0 && ctx.total_turns % every == 0)
}

/// Passes on the first extraction and then once `interval` has elapsed
pub fn check_time_interval(interval: Duration) -> Checker {
    Arc::new(move |ctx: &ExtractionContext<'_>| match ctx.last_extract_at {
        None => true,
        Some(last) => (Utc::now() - last)
            .to_std()
            .map_or(false, |elapsed| elapsed >= interval),
    })
}

/// Passes when every checker passes (vacuously true)
pub fn checks_all(checkers: Vec<Checker>) -> Checker {
    Arc::new(move |ctx: &ExtractionContext<'_>| checkers.iter().all(|check| check(ctx)))
}

/// Passes when any checker passes (vacuously false)
pub fn checks_any(checkers: Vec<Checker>) -> Checker {
    Arc::new(move |ctx: &ExtractionContext<'_>| checkers.iter().any(|check| check(ctx)))
}
