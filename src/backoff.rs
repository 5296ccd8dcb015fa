use std::time::Duration;

use rand::Rng as _;

/// Bound on the random jitter added to every delay.
pub const JITTER_WINDOW: Duration = Duration::from_secs(5);

/// Retry delays while the device believes it is online.
const NORMAL_DELAYS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
    Duration::from_secs(13),
    Duration::from_secs(21),
    Duration::from_secs(34),
    Duration::from_secs(55),
];

/// Retry delays while the device believes it is offline. No point hammering
/// a network that is known to be down.
const EXTENDED_DELAYS: &[Duration] = &[
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

/// Which fixed delay sequence the policy walks.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPreset {
    /// Short sequence, used while online
    Normal,
    /// Long sequence, used while offline
    Extended,
}

impl BackoffPreset {
    const fn delays(self) -> &'static [Duration] {
        match self {
            Self::Normal => NORMAL_DELAYS,
            Self::Extended => EXTENDED_DELAYS,
        }
    }
}

/// Stateful retry-delay generator.
///
/// Each call to [`next`](Self::next) returns the base value at the current
/// step of the active sequence (capped at the final entry) plus a uniformly
/// random jitter below [`JITTER_WINDOW`], then advances the step.
#[derive(Debug)]
pub struct BackoffPolicy {
    delays: &'static [Duration],
    index: usize,
    jitter: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(preset: BackoffPreset) -> Self {
        Self {
            delays: preset.delays(),
            index: 0,
            jitter: JITTER_WINDOW,
        }
    }

    /// Delay before the next retry; advances internal state.
    pub fn next(&mut self) -> Duration {
        let base = self.delays[self.index.min(self.delays.len() - 1)];
        self.index = self.index.saturating_add(1);
        base + self.random_jitter()
    }

    /// Zero the step counter, optionally swapping the underlying sequence.
    pub fn reset(&mut self, preset: Option<BackoffPreset>) {
        self.index = 0;
        if let Some(preset) = preset {
            self.delays = preset.delays();
        }
    }

    fn random_jitter(&self) -> Duration {
        let window = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..window))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffPreset::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter(preset: BackoffPreset) -> BackoffPolicy {
        BackoffPolicy {
            delays: preset.delays(),
            index: 0,
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn base_sequence_is_non_decreasing() {
        let mut policy = without_jitter(BackoffPreset::Normal);

        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = policy.next();
            assert!(delay >= previous, "sequence must never shrink");
            previous = delay;
        }
    }

    #[test]
    fn caps_at_final_entry() {
        let mut policy = without_jitter(BackoffPreset::Normal);

        for _ in 0..NORMAL_DELAYS.len() + 5 {
            let _: Duration = policy.next();
        }
        assert_eq!(policy.next(), *NORMAL_DELAYS.last().expect("non-empty"));
    }

    #[test]
    fn reset_returns_to_first_entry() {
        let mut policy = without_jitter(BackoffPreset::Normal);

        let first = policy.next();
        let _: Duration = policy.next();
        let _: Duration = policy.next();

        policy.reset(None);
        assert_eq!(policy.next(), first);
    }

    #[test]
    fn reset_swaps_sequence() {
        let mut policy = without_jitter(BackoffPreset::Normal);
        let _: Duration = policy.next();

        policy.reset(Some(BackoffPreset::Extended));
        assert_eq!(policy.next(), EXTENDED_DELAYS[0]);

        policy.reset(Some(BackoffPreset::Normal));
        assert_eq!(policy.next(), NORMAL_DELAYS[0]);
    }

    #[test]
    fn jitter_stays_within_window() {
        let mut policy = BackoffPolicy::new(BackoffPreset::Normal);

        for step in 0..NORMAL_DELAYS.len() {
            let delay = policy.next();
            let base = NORMAL_DELAYS[step];
            assert!(delay >= base, "jitter must only add");
            assert!(delay < base + JITTER_WINDOW, "jitter must stay bounded");
        }
    }
}
