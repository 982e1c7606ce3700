//! Delay and completion policies for a burst.
//!
//! Both are pure functions of the configuration and a handful of timestamps,
//! so the assembler can evaluate them under its lock and tests can evaluate
//! them without a runtime.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::AssemblyConfig;

/// Why a burst was judged complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// No fragment arrived for the armed window.
    Idle,
    /// The burst has been open longer than the session ceiling.
    SessionCeiling,
    /// The fragment count reached the hard cap.
    PartsCap,
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::SessionCeiling => write!(f, "session_ceiling"),
            Self::PartsCap => write!(f, "parts_cap"),
        }
    }
}

/// A completion check to be armed after a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm {
    /// Idle window the check will judge against.
    pub window: Duration,
    pub deadline: Instant,
    /// Forced checks keep an earlier pending deadline instead of replacing it.
    pub forced: bool,
}

/// Compute the check to arm after the `parts`-th fragment arrived at `now`.
pub fn arm(config: &AssemblyConfig, opened_at: Instant, parts: usize, now: Instant) -> Arm {
    let open_for = now.saturating_duration_since(opened_at);

    if parts >= config.max_parts
        || open_for >= config.force_after()
        || open_for > config.assembly_ceiling()
    {
        return Arm {
            window: config.min_delay(),
            deadline: now + config.min_delay(),
            forced: true,
        };
    }

    let window = if parts > config.fast_after_parts {
        config.fast_debounce()
    } else {
        config.debounce()
    };
    let hard_deadline = opened_at + config.force_after();

    Arm {
        window,
        deadline: (now + window).min(hard_deadline),
        forced: false,
    }
}

/// Decide whether the burst is complete at `now`.
///
/// The three conditions are OR-ed; the first that holds names the reason.
pub fn completion_reason(
    config: &AssemblyConfig,
    opened_at: Instant,
    last_fragment_at: Instant,
    parts: usize,
    armed_window: Duration,
    now: Instant,
) -> Option<CompletionReason> {
    let open_for = now.saturating_duration_since(opened_at);
    let idle_for = now.saturating_duration_since(last_fragment_at);

    if open_for >= config.force_after().min(config.assembly_ceiling()) {
        Some(CompletionReason::SessionCeiling)
    } else if parts >= config.max_parts {
        Some(CompletionReason::PartsCap)
    } else if idle_for >= armed_window.saturating_sub(config.idle_slack()) {
        Some(CompletionReason::Idle)
    } else {
        None
    }
}

/// When a not-yet-complete burst should be checked again.
pub fn recheck_deadline(
    config: &AssemblyConfig,
    opened_at: Instant,
    last_fragment_at: Instant,
    armed_window: Duration,
    now: Instant,
) -> Instant {
    let idle_at = last_fragment_at + armed_window.saturating_sub(config.idle_slack());
    let hard_deadline = opened_at + config.force_after();
    idle_at.min(hard_deadline).max(now + config.min_delay().min(armed_window))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_arm_uses_base_window_for_first_parts() {
        let config = AssemblyConfig::default();
        let t0 = Instant::now();
        let arm = arm(&config, t0, 1, t0);
        assert_eq!(arm.window, ms(2000));
        assert_eq!(arm.deadline, t0 + ms(2000));
        assert!(!arm.forced);
    }

    #[test]
    fn test_arm_shortens_window_after_several_parts() {
        let config = AssemblyConfig {
            max_parts: 10,
            ..Default::default()
        };
        let t0 = Instant::now();
        assert_eq!(arm(&config, t0, 3, t0 + ms(300)).window, ms(2000));
        assert_eq!(arm(&config, t0, 4, t0 + ms(400)).window, ms(1500));
    }

    #[test]
    fn test_arm_forced_at_parts_cap() {
        let config = AssemblyConfig::default();
        let t0 = Instant::now();
        let arm = arm(&config, t0, 4, t0 + ms(450));
        assert!(arm.forced);
        assert_eq!(arm.deadline, t0 + ms(550));
    }

    #[test]
    fn test_arm_forced_past_ceiling() {
        let config = AssemblyConfig {
            force_after_ms: 120_000,
            max_parts: 1000,
            ..Default::default()
        };
        let t0 = Instant::now();
        let arm = arm(&config, t0, 2, t0 + ms(60_001));
        assert!(arm.forced);
        assert_eq!(arm.window, ms(100));
    }

    #[test]
    fn test_arm_clamped_to_session_ceiling() {
        let config = AssemblyConfig {
            max_parts: 1000,
            ..Default::default()
        };
        let t0 = Instant::now();
        let arm = arm(&config, t0, 2, t0 + ms(9_000));
        assert!(!arm.forced);
        assert_eq!(arm.deadline, t0 + ms(10_000));
    }

    #[test]
    fn test_completion_idle() {
        let config = AssemblyConfig::default();
        let t0 = Instant::now();
        let last = t0 + ms(500);
        assert_eq!(
            completion_reason(&config, t0, last, 2, ms(2000), last + ms(1000)),
            None
        );
        assert_eq!(
            completion_reason(&config, t0, last, 2, ms(2000), last + ms(1900)),
            Some(CompletionReason::Idle)
        );
    }

    #[test]
    fn test_completion_parts_cap_and_ceiling() {
        let config = AssemblyConfig::default();
        let t0 = Instant::now();
        assert_eq!(
            completion_reason(&config, t0, t0 + ms(400), 4, ms(100), t0 + ms(450)),
            Some(CompletionReason::PartsCap)
        );
        assert_eq!(
            completion_reason(&config, t0, t0 + ms(9_990), 2, ms(2000), t0 + ms(10_000)),
            Some(CompletionReason::SessionCeiling)
        );
    }

    #[test]
    fn test_recheck_deadline_waits_for_remaining_idle_time() {
        let config = AssemblyConfig::default();
        let t0 = Instant::now();
        let last = t0 + ms(1000);
        let deadline = recheck_deadline(&config, t0, last, ms(2000), last + ms(500));
        assert_eq!(deadline, last + ms(1900));
    }
}
