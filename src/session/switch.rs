//! Latency-driven provider switch policy.
//!
//! The controller keeps a trimmed window of round-trip samples per provider.
//! When the last N samples for the current provider all sit strictly above
//! the threshold, it picks the alternate provider, clears the leaving
//! provider's history, and reports the target. Clearing forces another full
//! window of samples before a reverse switch can fire.

use std::collections::HashMap;

use crate::events::ApiStyle;
use crate::provider::LatencySample;

/// Per-provider sample history cap. Old samples are trimmed; only the most
/// recent window matters for the policy.
const SAMPLE_WINDOW: usize = 64;

pub struct SwitchController {
    current: ApiStyle,
    threshold_ms: u64,
    consecutive: usize,
    samples: HashMap<ApiStyle, Vec<u64>>,
}

impl SwitchController {
    pub fn new(initial: ApiStyle, threshold_ms: u64, consecutive: usize) -> Self {
        Self {
            current: initial,
            threshold_ms,
            consecutive: consecutive.max(1),
            samples: HashMap::new(),
        }
    }

    pub fn current(&self) -> ApiStyle {
        self.current
    }

    /// Record a sample. Returns the switch target when the policy fires.
    pub fn add_sample(&mut self, sample: &LatencySample) -> Option<ApiStyle> {
        let history = self.samples.entry(sample.provider).or_default();
        history.push(sample.latency_ms);
        if history.len() > SAMPLE_WINDOW {
            let excess = history.len() - SAMPLE_WINDOW;
            history.drain(..excess);
        }

        if sample.provider != self.current {
            return None;
        }

        let history = &self.samples[&self.current];
        if history.len() < self.consecutive {
            return None;
        }

        let recent = &history[history.len() - self.consecutive..];
        if !recent.iter().all(|&latency| latency > self.threshold_ms) {
            return None;
        }

        let target = self.current.other();
        tracing::warn!(
            from = %self.current,
            to = %target,
            threshold_ms = self.threshold_ms,
            window = self.consecutive,
            "Latency policy fired, switching provider"
        );
        self.samples.remove(&self.current);
        self.current = target;
        Some(target)
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(provider: ApiStyle, latency_ms: u64) -> LatencySample {
        LatencySample {
            timestamp_ms: 0,
            latency_ms,
            provider,
        }
    }

    fn controller() -> SwitchController {
        SwitchController::new(ApiStyle::OpenAi, 500, 3)
    }

    #[test]
    fn fires_after_n_consecutive_over_threshold() {
        let mut switch = controller();
        assert_eq!(switch.add_sample(&sample(ApiStyle::OpenAi, 600)), None);
        assert_eq!(switch.add_sample(&sample(ApiStyle::OpenAi, 600)), None);
        assert_eq!(
            switch.add_sample(&sample(ApiStyle::OpenAi, 600)),
            Some(ApiStyle::Gemini)
        );
        assert_eq!(switch.current(), ApiStyle::Gemini);
    }

    #[test]
    fn one_good_sample_resets_the_streak() {
        let mut switch = controller();
        for latency in [600, 499, 600, 600] {
            assert_eq!(switch.add_sample(&sample(ApiStyle::OpenAi, latency)), None);
        }
        // The fifth over-threshold sample completes a fresh window.
        assert_eq!(
            switch.add_sample(&sample(ApiStyle::OpenAi, 600)),
            Some(ApiStyle::Gemini)
        );
    }

    #[test]
    fn threshold_is_strict() {
        let mut switch = controller();
        for _ in 0..5 {
            assert_eq!(switch.add_sample(&sample(ApiStyle::OpenAi, 500)), None);
        }
        assert_eq!(switch.current(), ApiStyle::OpenAi);
    }

    #[test]
    fn non_current_provider_samples_never_fire() {
        let mut switch = controller();
        for _ in 0..5 {
            assert_eq!(switch.add_sample(&sample(ApiStyle::Gemini, 900)), None);
        }
        assert_eq!(switch.current(), ApiStyle::OpenAi);
    }

    #[test]
    fn exactly_one_switch_then_quiet_until_new_window() {
        let mut switch = controller();
        switch.add_sample(&sample(ApiStyle::OpenAi, 600));
        switch.add_sample(&sample(ApiStyle::OpenAi, 600));
        assert!(switch.add_sample(&sample(ApiStyle::OpenAi, 600)).is_some());

        // Stale slow samples from the old provider are ignored now.
        assert_eq!(switch.add_sample(&sample(ApiStyle::OpenAi, 900)), None);

        // The new provider needs a complete fresh window before switching
        // back, because the leaving history was cleared.
        assert_eq!(switch.add_sample(&sample(ApiStyle::Gemini, 900)), None);
        assert_eq!(switch.add_sample(&sample(ApiStyle::Gemini, 900)), None);
        assert_eq!(
            switch.add_sample(&sample(ApiStyle::Gemini, 900)),
            Some(ApiStyle::OpenAi)
        );
    }

    #[test]
    fn reverse_switch_needs_fresh_history_again() {
        let mut switch = controller();
        for _ in 0..3 {
            switch.add_sample(&sample(ApiStyle::OpenAi, 600));
        }
        assert_eq!(switch.current(), ApiStyle::Gemini);
        for _ in 0..3 {
            switch.add_sample(&sample(ApiStyle::Gemini, 600));
        }
        assert_eq!(switch.current(), ApiStyle::OpenAi);
        // History for the provider we just left was cleared on the way out.
        assert_eq!(switch.add_sample(&sample(ApiStyle::OpenAi, 600)), None);
        assert_eq!(switch.add_sample(&sample(ApiStyle::OpenAi, 600)), None);
        assert_eq!(
            switch.add_sample(&sample(ApiStyle::OpenAi, 600)),
            Some(ApiStyle::Gemini)
        );
    }

    #[test]
    fn history_is_trimmed_to_window() {
        let mut switch = controller();
        for _ in 0..(SAMPLE_WINDOW * 2) {
            switch.add_sample(&sample(ApiStyle::Gemini, 100));
        }
        assert!(switch.samples[&ApiStyle::Gemini].len() <= SAMPLE_WINDOW);
    }
}
