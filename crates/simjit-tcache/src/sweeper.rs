//! Incremental, decay-driven eviction of cold blocks.

use crate::cache::TranslationCache;
use crate::config::SweepPolicy;
use crate::error::Result;
use crate::protect::CodeProtection;

/// Adapts sweep aggressiveness to how fast new blocks are being committed.
///
/// Every [`TranslationCache::sample`] tick records the commits seen since the previous tick.
/// Once `window` ticks have been recorded, `m = floor(log2(average))` sets both the number of
/// sweep steps run per commit under pressure and how often lookup misses trigger a sweep.
#[derive(Debug)]
pub(crate) struct SweepController {
    samples: Vec<u64>,
    next: usize,
    filled: bool,
    base_clean_freq: u32,
    pub(crate) commits_since_sample: u64,
    pub(crate) sweeps_per_commit: u32,
    pub(crate) clean_freq: u32,
    pub(crate) miss_count: u32,
    /// Invalidated blocks since the last miss-driven cleanup.
    pub(crate) pending: u32,
}

impl SweepController {
    pub(crate) fn new(policy: &SweepPolicy) -> Self {
        Self {
            samples: vec![0; policy.window],
            next: 0,
            filled: false,
            base_clean_freq: policy.base_clean_freq,
            commits_since_sample: 0,
            sweeps_per_commit: 0,
            clean_freq: policy.base_clean_freq.max(1),
            miss_count: 0,
            pending: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.samples.fill(0);
        self.next = 0;
        self.filled = false;
        self.commits_since_sample = 0;
        self.sweeps_per_commit = 0;
        self.clean_freq = self.base_clean_freq.max(1);
        self.miss_count = 0;
        self.pending = 0;
    }

    pub(crate) fn sample(&mut self) {
        self.samples[self.next] = std::mem::take(&mut self.commits_since_sample);
        self.next += 1;
        if self.next == self.samples.len() {
            self.next = 0;
            self.filled = true;
        }
        if !self.filled {
            return;
        }
        let avg = self.samples.iter().sum::<u64>() / self.samples.len() as u64;
        let m = avg.checked_ilog2().unwrap_or(0);
        self.sweeps_per_commit = m;
        self.clean_freq = self.base_clean_freq.saturating_sub(m).max(1);
    }

    /// Sweep steps a lookup miss should run, given the current live count.
    pub(crate) fn on_miss(&mut self, live: usize, threshold: usize) -> u32 {
        if live <= threshold {
            return 0;
        }
        self.miss_count += 1;
        if self.miss_count < self.clean_freq && self.pending == 0 {
            return 0;
        }
        self.miss_count = 0;
        std::mem::take(&mut self.pending).max(1)
    }
}

impl<P: CodeProtection> TranslationCache<P> {
    /// Advance the sweeper cursor by one block and age or reclaim it.
    ///
    /// Returns `true` when the visited block was deleted; the following step then visits that
    /// block's successor. A step landing on the header sentinel (end of a full pass) does nothing.
    pub fn sweep_step(&mut self) -> Result<bool> {
        let prev = self.index.cursor();
        let next = self.index.walk_from(prev);
        self.index.set_cursor(next);
        let Some(id) = next else {
            tracing::trace!("sweeper wrapped");
            return Ok(false);
        };

        let decay = self.config.sweep.decay;
        let Some(block) = self.index.block_mut(id) else {
            return Ok(false);
        };
        let key = block.key;
        if block.alive {
            block.life -= decay;
            if block.life > 0 {
                return Ok(false);
            }
            tracing::trace!(key, "sweeper evicting cold block");
            self.kill(id)?;
        } else {
            tracing::trace!(key, "sweeper reclaiming dead block");
        }
        // Park the cursor behind the victim so the next step lands on its successor.
        self.index.set_cursor(prev);
        self.remove(id)?;
        self.counters.swept += 1;
        Ok(true)
    }

    /// Run `steps` sweep steps.
    pub(crate) fn sweep(&mut self, steps: u32) -> Result<()> {
        for _ in 0..steps {
            self.sweep_step()?;
        }
        Ok(())
    }

    /// Periodic statistics tick driving the sweep controller.
    pub fn sample(&mut self) {
        self.controller.sample();
        tracing::debug!(
            live = self.index.len(),
            sweeps_per_commit = self.controller.sweeps_per_commit,
            clean_freq = self.controller.clean_freq,
            "translation cache sample"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_waits_for_a_full_window() {
        let policy = SweepPolicy {
            window: 2,
            base_clean_freq: 8,
            ..SweepPolicy::default()
        };
        let mut ctl = SweepController::new(&policy);
        ctl.commits_since_sample = 64;
        ctl.sample();
        assert_eq!(ctl.sweeps_per_commit, 0);
        assert_eq!(ctl.clean_freq, 8);

        ctl.commits_since_sample = 64;
        ctl.sample();
        assert_eq!(ctl.sweeps_per_commit, 6);
        assert_eq!(ctl.clean_freq, 2);

        ctl.commits_since_sample = 100_000;
        ctl.sample();
        assert_eq!(ctl.clean_freq, 1);
    }

    #[test]
    fn misses_sweep_every_clean_freq_or_when_pending() {
        let mut ctl = SweepController::new(&SweepPolicy {
            base_clean_freq: 3,
            ..SweepPolicy::default()
        });
        assert_eq!(ctl.on_miss(10, 500), 0);
        assert_eq!(ctl.miss_count, 0);

        assert_eq!(ctl.on_miss(600, 500), 0);
        assert_eq!(ctl.on_miss(600, 500), 0);
        assert_eq!(ctl.on_miss(600, 500), 1);

        ctl.pending = 5;
        assert_eq!(ctl.on_miss(600, 500), 5);
        assert_eq!(ctl.pending, 0);
    }
}
