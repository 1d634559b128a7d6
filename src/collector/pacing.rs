//! Cycle pacing
//!
//! Best-effort fixed cadence: sleep off whatever is left of the period, or
//! start the next cycle straight away and report the overrun.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Time left in the period before the next cycle
    Sleep(Duration),
    /// Cycle took at least the full period, by this much over
    Overrun(Duration),
}

pub fn pace(period: Duration, elapsed: Duration) -> Pacing {
    match period.checked_sub(elapsed) {
        Some(remaining) if !remaining.is_zero() => Pacing::Sleep(remaining),
        _ => Pacing::Overrun(elapsed.saturating_sub(period)),
    }
}
