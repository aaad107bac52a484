/// Accumulation of adapter deltas into a base weight set
///
/// Every step takes the current weights by reference and returns a new owned
/// weight set. Untouched tensors are shared (candle tensors are refcounted);
/// an updated target is replaced by a freshly computed tensor, so a pair
/// either lands completely or not at all.

use crate::adapter::{self, Extracted, FactorConvention};
use crate::keys::KeyResolver;
use crate::{Error, LowRankDelta, WeightSet};
use std::fmt;
use tracing::{debug, info};

/// Why a pair contributed nothing
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Down factor present, up factor absent
    MissingUp(FactorConvention),
    /// No base key under any naming transform
    Unresolved,
    /// Factor dimensionalities are not 2D/2D or 4D/4D with a 1×1 up kernel
    UnsupportedShape { down: Vec<usize>, up: Vec<usize> },
    /// Reconstructed delta does not fit the target
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    /// Any other failure while building or adding the delta
    Compute(String),
}

impl From<Error> for SkipReason {
    fn from(err: Error) -> Self {
        match err {
            Error::UnsupportedShape { down, up } => SkipReason::UnsupportedShape { down, up },
            Error::ShapeMismatch { expected, got } => SkipReason::ShapeMismatch { expected, got },
            other => SkipReason::Compute(other.to_string()),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingUp(c) => write!(f, "missing up factor ({})", c),
            SkipReason::Unresolved => f.write_str("no matching base key"),
            SkipReason::UnsupportedShape { down, up } => {
                write!(f, "unsupported factor shapes down {:?} up {:?}", down, up)
            }
            SkipReason::ShapeMismatch { expected, got } => {
                write!(f, "delta shape {:?} does not fit target {:?}", got, expected)
            }
            SkipReason::Compute(msg) => write!(f, "compute error: {}", msg),
        }
    }
}

/// Outcome of one adapter pair
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Applied { group: String, target: String },
    Skipped { group: String, reason: SkipReason },
}

impl PairOutcome {
    pub fn group(&self) -> &str {
        match self {
            PairOutcome::Applied { group, .. } | PairOutcome::Skipped { group, .. } => group,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, PairOutcome::Applied { .. })
    }
}

/// Per-adapter summary
#[derive(Debug, Clone, Default)]
pub struct AdapterReport {
    pub outcomes: Vec<PairOutcome>,
}

impl AdapterReport {
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_applied()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.applied()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn skip_reasons(&self) -> impl Iterator<Item = (&str, &SkipReason)> {
        self.outcomes.iter().filter_map(|o| match o {
            PairOutcome::Skipped { group, reason } => Some((group.as_str(), reason)),
            PairOutcome::Applied { .. } => None,
        })
    }
}

/// Applies adapters, in order, onto a working copy of the base
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    resolver: KeyResolver,
}

impl Accumulator {
    pub fn new(resolver: KeyResolver) -> Self {
        Self { resolver }
    }

    /// Apply one adapter with `strength`, returning the new weights
    pub fn apply_adapter(
        &self,
        weights: &WeightSet,
        adapter: &WeightSet,
        strength: f64,
    ) -> (WeightSet, AdapterReport) {
        self.apply_adapter_observed(weights, adapter, strength, |_| {})
    }

    /// Like [`apply_adapter`](Self::apply_adapter), calling `observe` after every pair
    pub fn apply_adapter_observed<F>(
        &self,
        weights: &WeightSet,
        adapter: &WeightSet,
        strength: f64,
        mut observe: F,
    ) -> (WeightSet, AdapterReport)
    where
        F: FnMut(&PairOutcome),
    {
        let mut working = weights.clone();
        let mut report = AdapterReport::default();

        for group in adapter::group_ids(adapter) {
            let outcome = self.apply_pair(&mut working, adapter, &group, strength);
            if let PairOutcome::Skipped { group, reason } = &outcome {
                debug!(group = %group, reason = %reason, "Skipped LoRA pair");
            }
            observe(&outcome);
            report.outcomes.push(outcome);
        }

        info!(
            applied = report.applied(),
            skipped = report.skipped(),
            strength,
            "Applied LoRA weight pairs"
        );
        (working, report)
    }

    /// Apply an ordered list of (adapter, strength) entries sequentially
    ///
    /// Each adapter sees the weights already updated by the ones before it.
    pub fn apply_all<'a, I>(&self, base: &WeightSet, adapters: I) -> (WeightSet, Vec<AdapterReport>)
    where
        I: IntoIterator<Item = (&'a WeightSet, f64)>,
    {
        let mut current = base.clone();
        let mut reports = Vec::new();
        for (adapter, strength) in adapters {
            let (next, report) = self.apply_adapter(&current, adapter, strength);
            current = next;
            reports.push(report);
        }
        (current, reports)
    }

    fn apply_pair(
        &self,
        working: &mut WeightSet,
        adapter: &WeightSet,
        group: &str,
        strength: f64,
    ) -> PairOutcome {
        let skip = |reason: SkipReason| PairOutcome::Skipped {
            group: group.to_string(),
            reason,
        };

        let pair = match adapter::extract_pair(adapter, group) {
            Ok(Extracted::Pair(pair)) => pair,
            Ok(Extracted::MissingUp { convention }) => return skip(SkipReason::MissingUp(convention)),
            // group_ids only yields groups with a down factor
            Ok(Extracted::MissingDown) => return skip(SkipReason::Unresolved),
            Err(err) => return skip(err.into()),
        };

        let Some(resolved) = self.resolver.resolve(group, working) else {
            return skip(SkipReason::Unresolved);
        };

        let target = &working[&resolved.key];
        match pair.merge_into(target, strength) {
            Ok(updated) => {
                working.insert(resolved.key.clone(), updated);
                PairOutcome::Applied {
                    group: group.to_string(),
                    target: resolved.key,
                }
            }
            Err(err) => skip(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn tensor(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn base() -> WeightSet {
        let mut w = WeightSet::new();
        w.insert("layer.weight".into(), Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap());
        w.insert("other.weight".into(), Tensor::ones((3, 3), DType::F32, &Device::Cpu).unwrap());
        w
    }

    fn adapter() -> WeightSet {
        let mut a = WeightSet::new();
        a.insert("lora_unet_layer.lora_down.weight".into(), tensor(&[1.0, 2.0], &[1, 2]));
        a.insert("lora_unet_layer.lora_up.weight".into(), tensor(&[1.0, 1.0], &[2, 1]));
        a.insert("lora_unet_missing.lora_down.weight".into(), tensor(&[1.0, 2.0], &[1, 2]));
        a.insert("lora_unet_missing.lora_up.weight".into(), tensor(&[1.0, 1.0], &[2, 1]));
        a.insert("lora_unet_other.lora_down.weight".into(), tensor(&[1.0, 2.0], &[1, 2]));
        a
    }

    #[test]
    fn test_report_counts() {
        let acc = Accumulator::default();
        let (_, report) = acc.apply_adapter(&base(), &adapter(), 1.0);

        assert_eq!(report.total(), 3);
        assert_eq!(report.applied(), 1);
        assert_eq!(report.skipped(), 2);

        let reasons: Vec<_> = report.skip_reasons().collect();
        assert!(reasons.contains(&("lora_unet_missing", &SkipReason::Unresolved)));
        assert!(reasons.contains(&(
            "lora_unet_other",
            &SkipReason::MissingUp(FactorConvention::DownUp)
        )));
    }

    #[test]
    fn test_input_weights_untouched() {
        let acc = Accumulator::default();
        let original = base();
        let (merged, _) = acc.apply_adapter(&original, &adapter(), 1.0);

        let before = original["layer.weight"].to_vec2::<f32>().unwrap();
        let after = merged["layer.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(before, vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
        assert_eq!(after, vec![vec![1.0, 2.0], vec![1.0, 2.0]]);
    }

    #[test]
    fn test_observer_sees_every_pair() {
        let acc = Accumulator::default();
        let mut seen = Vec::new();
        acc.apply_adapter_observed(&base(), &adapter(), 1.0, |o| seen.push(o.group().to_string()));
        assert_eq!(
            seen,
            vec!["lora_unet_layer", "lora_unet_missing", "lora_unet_other"]
        );
    }

    #[test]
    fn test_shape_mismatch_is_skipped() {
        let mut a = WeightSet::new();
        a.insert("lora_unet_other.lora_down.weight".into(), tensor(&[1.0, 2.0], &[1, 2]));
        a.insert("lora_unet_other.lora_up.weight".into(), tensor(&[1.0, 1.0], &[2, 1]));

        let acc = Accumulator::default();
        let (merged, report) = acc.apply_adapter(&base(), &a, 1.0);

        assert_eq!(report.applied(), 0);
        assert!(matches!(
            report.outcomes[0],
            PairOutcome::Skipped {
                reason: SkipReason::ShapeMismatch { .. },
                ..
            }
        ));
        assert_eq!(merged["other.weight"].dims(), &[3, 3]);
    }

    #[test]
    fn test_skip_reason_from_error() {
        let reason: SkipReason = Error::RankMismatch { down: 2, up: 3 }.into();
        assert!(matches!(reason, SkipReason::Compute(_)));

        let reason: SkipReason = Error::UnsupportedShape {
            down: vec![2],
            up: vec![2],
        }
        .into();
        assert!(matches!(reason, SkipReason::UnsupportedShape { .. }));
    }
}
