//! Closed-form learning-rate schedule.
//!
//! Linear warmup from `0.1 * lr` to `lr` over `warmup_steps`, then cosine
//! annealing with warm restarts: the first cycle lasts `cosine_t0` steps and
//! each following cycle is `cosine_t_mult` times longer, decaying towards
//! `eta_min_factor * lr`. Computing it from the step index lets catch-up
//! reproduce the rate of any past window without replaying a scheduler.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::config::HParams;

const WARMUP_START_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub warmup_steps: u64,
    pub t0: u64,
    pub t_mult: u64,
    pub eta_min: f64,
}

impl LrSchedule {
    pub fn from_hparams(hparams: &HParams) -> Self {
        Self {
            base_lr: hparams.learning_rate,
            warmup_steps: hparams.warmup_steps,
            t0: hparams.cosine_t0.max(1),
            t_mult: hparams.cosine_t_mult.max(1),
            eta_min: hparams.learning_rate * hparams.eta_min_factor,
        }
    }

    /// Learning rate in effect at `step` (0-based).
    pub fn lr_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            let progress = step as f64 / self.warmup_steps as f64;
            let factor = WARMUP_START_FACTOR + (1.0 - WARMUP_START_FACTOR) * progress;
            return self.base_lr * factor;
        }

        let (t_cur, t_i) = self.cycle_position(step - self.warmup_steps);
        self.eta_min
            + (self.base_lr - self.eta_min) * (1.0 + (PI * t_cur as f64 / t_i as f64).cos()) / 2.0
    }

    /// Position inside the current restart cycle and that cycle's length.
    fn cycle_position(&self, t: u64) -> (u64, u64) {
        if self.t_mult == 1 {
            return (t % self.t0, self.t0);
        }
        let mut start = 0u64;
        let mut len = self.t0;
        while t >= start.saturating_add(len) {
            start = start.saturating_add(len);
            len = len.saturating_mul(self.t_mult);
        }
        (t - start, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> LrSchedule {
        LrSchedule {
            base_lr: 1.0,
            warmup_steps: 10,
            t0: 100,
            t_mult: 2,
            eta_min: 0.1,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn warmup_is_linear_from_a_tenth() {
        let s = schedule();
        assert!(close(s.lr_at(0), 0.1));
        assert!(close(s.lr_at(5), 0.55));
    }

    #[test]
    fn cosine_starts_at_base_and_restarts() {
        let s = schedule();
        assert!(close(s.lr_at(10), 1.0));
        // Half way through the first cycle.
        assert!(close(s.lr_at(60), 0.55));
        // First restart after t0 steps; second cycle is twice as long.
        assert!(close(s.lr_at(110), 1.0));
        assert!(close(s.lr_at(210), 0.55));
        assert!(close(s.lr_at(310), 1.0));
    }

    #[test]
    fn never_below_eta_min() {
        let s = schedule();
        for step in 0..2_000 {
            assert!(s.lr_at(step) >= 0.1 - 1e-12);
            assert!(s.lr_at(step) <= 1.0 + 1e-12);
        }
    }

    #[test]
    fn t_mult_one_repeats_cycle() {
        let s = LrSchedule {
            t_mult: 1,
            ..schedule()
        };
        assert!(close(s.lr_at(60), s.lr_at(160)));
    }

    #[test]
    fn no_warmup() {
        let s = LrSchedule {
            warmup_steps: 0,
            ..schedule()
        };
        assert!(close(s.lr_at(0), 1.0));
    }
}
