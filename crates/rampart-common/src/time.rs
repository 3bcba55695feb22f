//! ---
//! rampart_section: "01-core-functionality"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Shared primitives and utilities for the resilience runtime."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Convert a duration into whole milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Convert a std duration to a chrono duration, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Milliseconds elapsed between two wall-clock instants, clamped at zero.
pub fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Return the wall-clock instant `window` before `now`.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturate_and_clamp() {
        assert_eq!(duration_to_millis(Duration::from_millis(1500)), 1500);
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(250);
        assert_eq!(millis_between(now, later), 250);
        assert_eq!(millis_between(later, now), 0);
    }

    #[test]
    fn window_start_handles_huge_windows() {
        let now = Utc::now();
        assert_eq!(
            window_start(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(window_start(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
