//! Miner-side gradient preparation with error-feedback momentum.
//!
//! Per parameter: `m = decay * m + lr * grad`, transmit the top-k DCT
//! coefficients of `m`, then subtract what was transmitted so the residual
//! carries over to the next window.

use std::collections::BTreeMap;

use tracing::debug;

use crate::artifact::GradientArtifact;
use crate::codec::{Tensor, TransformDct};
use crate::collaborators::Trainer;
use crate::error::Result;

pub struct GradientPreparer {
    momentum: BTreeMap<String, Tensor>,
    momentum_decay: f32,
    topk: usize,
}

impl GradientPreparer {
    pub fn new(momentum_decay: f64, topk: usize) -> Self {
        Self {
            momentum: BTreeMap::new(),
            momentum_decay: momentum_decay as f32,
            topk,
        }
    }

    pub fn momentum(&self) -> &BTreeMap<String, Tensor> {
        &self.momentum
    }

    /// Restore momentum from a checkpoint.
    pub fn set_momentum(&mut self, momentum: BTreeMap<String, Tensor>) {
        self.momentum = momentum;
    }

    /// Build this window's artifact from the trainer's current gradients.
    ///
    /// Parameters without a gradient are treated as a zero gradient so every
    /// parameter appears in the artifact.
    pub fn prepare(
        &mut self,
        trainer: &dyn Trainer,
        dct: &mut TransformDct,
        learning_rate: f64,
    ) -> Result<GradientArtifact> {
        let mut params = BTreeMap::new();
        for p in trainer.named_parameters() {
            let m = self
                .momentum
                .entry(p.name.to_string())
                .or_insert_with(|| Tensor::zeros(p.value.shape()));
            if m.shape() != p.value.shape() {
                *m = Tensor::zeros(p.value.shape());
            }

            let mut next = m.scaled(self.momentum_decay);
            if let Some(grad) = p.grad {
                next.add_scaled(grad, learning_rate as f32)?;
            }

            let (geometry, sparse) = dct.compress_tensor(&next, self.topk);
            let transmitted = dct.decompress(&geometry, &sparse)?;
            next.add_scaled(&transmitted, -1.0)?;
            *m = next;

            debug!(param = p.name, entries = sparse.len(), "compressed");
            params.insert(p.name.to_string(), sparse);
        }
        Ok(GradientArtifact { params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::QuadraticTrainer;

    #[test]
    fn residual_stays_in_momentum() {
        let mut trainer = QuadraticTrainer::new([("w", vec![0.0; 8])]);
        trainer.set_gradient("w", Tensor::vector(vec![1.0, -2.0, 0.5, 0.0, 3.0, 0.0, -0.25, 1.5]));
        let mut dct = TransformDct::new(8);
        let mut prep = GradientPreparer::new(0.9, 2);

        let artifact = prep.prepare(&trainer, &mut dct, 1.0).unwrap();
        let sparse = artifact.get("w").unwrap();
        assert_eq!(sparse.len(), 2);

        // transmitted + residual reconstructs the full momentum.
        let geometry = dct.geometry(&[8]);
        let transmitted = dct.decompress(&geometry, sparse).unwrap();
        let mut total = prep.momentum()["w"].clone();
        total.add_scaled(&transmitted, 1.0).unwrap();
        for (a, b) in total.data().iter().zip([1.0, -2.0, 0.5, 0.0, 3.0, 0.0, -0.25, 1.5]) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn full_topk_leaves_no_residual() {
        let mut trainer = QuadraticTrainer::new([("w", vec![0.0; 4])]);
        trainer.set_gradient("w", Tensor::vector(vec![0.5, -1.0, 2.0, 0.25]));
        let mut dct = TransformDct::new(4);
        let mut prep = GradientPreparer::new(0.5, 4);

        prep.prepare(&trainer, &mut dct, 0.1).unwrap();
        assert!(prep.momentum()["w"].l2_norm() < 1e-5);
    }
}
