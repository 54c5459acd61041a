//! Normalization-mode bracketing for adversarial probing.
//!
//! The extra forward passes used to search for an adversarial direction must
//! not leak into the model's running normalization statistics, which should
//! only ever reflect clean-data passes. `freeze`/`unfreeze` are paired around
//! any probing code; `unfreeze` restores the exact mode the model had before
//! the first `freeze`.

use crate::model::NormFreeze;

/// Toggles a model's norm layers between batch-statistics mode and
/// frozen running-statistics mode. Idempotent and symmetric.
#[derive(Debug, Default)]
pub struct BatchNormController {
    prior: Option<bool>,
}

impl BatchNormController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put every norm layer into frozen mode, remembering the current mode
    /// the first time.
    pub fn freeze<M: NormFreeze>(&mut self, model: M) -> M {
        if self.prior.is_none() {
            self.prior = Some(model.norms_frozen());
        }
        model.with_norms_frozen(true)
    }

    /// Restore the mode recorded by the matching `freeze`. Without a prior
    /// `freeze` this is a no-op.
    pub fn unfreeze<M: NormFreeze>(&mut self, model: M) -> M {
        match self.prior.take() {
            Some(prior) => model.with_norms_frozen(prior),
            None => model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Toggle(bool);

    impl NormFreeze for Toggle {
        fn norms_frozen(&self) -> bool {
            self.0
        }
        fn with_norms_frozen(self, frozen: bool) -> Self {
            Toggle(frozen)
        }
    }

    #[test]
    fn test_freeze_unfreeze_round_trip() {
        let mut controller = BatchNormController::new();
        let model = Toggle(false);
        let model = controller.freeze(model);
        assert!(model.0);
        let model = controller.unfreeze(model);
        assert!(!model.0);
    }

    #[test]
    fn test_restores_pre_freeze_frozen_mode() {
        let mut controller = BatchNormController::new();
        let model = Toggle(true);
        let model = controller.freeze(model);
        assert!(model.0);
        let model = controller.unfreeze(model);
        // Was frozen before the bracket; stays frozen after.
        assert!(model.0);
    }

    #[test]
    fn test_freeze_is_idempotent() {
        let mut controller = BatchNormController::new();
        let model = Toggle(false);
        let model = controller.freeze(model);
        let model = controller.freeze(model);
        let model = controller.unfreeze(model);
        assert!(!model.0);
    }

    #[test]
    fn test_unfreeze_without_freeze_is_noop() {
        let mut controller = BatchNormController::new();
        let model = controller.unfreeze(Toggle(true));
        assert!(model.0);
    }
}
