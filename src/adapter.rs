/// Adapter pair extraction
///
/// Groups the entries of an adapter weight set into down/up factor pairs.
/// Two conventions are recognized:
/// - kohya style: `<group>.lora_down.weight` / `<group>.lora_up.weight`
/// - PEFT style:  `<group>.lora_A.weight` / `<group>.lora_B.weight`
///
/// Both store the optional alpha scalar under `<group>.alpha`.

use crate::algorithms::LoraPair;
use crate::{tensor_utils, Result, WeightSet};
use std::collections::BTreeSet;
use std::fmt;

pub const ALPHA_SUFFIX: &str = ".alpha";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorConvention {
    /// `lora_down` / `lora_up`
    DownUp,
    /// `lora_A` / `lora_B`
    AB,
}

impl FactorConvention {
    /// Lookup order when a group carries both conventions
    pub const ALL: [FactorConvention; 2] = [FactorConvention::DownUp, FactorConvention::AB];

    pub fn down_suffix(self) -> &'static str {
        match self {
            FactorConvention::DownUp => ".lora_down.weight",
            FactorConvention::AB => ".lora_A.weight",
        }
    }

    pub fn up_suffix(self) -> &'static str {
        match self {
            FactorConvention::DownUp => ".lora_up.weight",
            FactorConvention::AB => ".lora_B.weight",
        }
    }
}

impl fmt::Display for FactorConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactorConvention::DownUp => f.write_str("down/up"),
            FactorConvention::AB => f.write_str("A/B"),
        }
    }
}

/// Result of looking up one group's factors
#[derive(Debug, Clone)]
pub enum Extracted {
    Pair(LoraPair),
    /// A down factor exists but its up partner does not
    MissingUp { convention: FactorConvention },
    /// No down factor under any convention
    MissingDown,
}

/// Distinct group ids that own a down (or A) factor, in sorted order
pub fn group_ids(adapter: &WeightSet) -> BTreeSet<String> {
    adapter
        .keys()
        .filter_map(|key| {
            FactorConvention::ALL
                .iter()
                .find_map(|c| key.strip_suffix(c.down_suffix()))
        })
        .map(str::to_string)
        .collect()
}

/// Fetch the down/up factors and alpha for `group`
///
/// Fails only when an alpha entry exists but is not a scalar.
pub fn extract_pair(adapter: &WeightSet, group: &str) -> Result<Extracted> {
    let Some(convention) = FactorConvention::ALL
        .into_iter()
        .find(|c| adapter.contains_key(&format!("{}{}", group, c.down_suffix())))
    else {
        return Ok(Extracted::MissingDown);
    };

    let down = &adapter[&format!("{}{}", group, convention.down_suffix())];
    let Some(up) = adapter.get(&format!("{}{}", group, convention.up_suffix())) else {
        return Ok(Extracted::MissingUp { convention });
    };

    let alpha = adapter
        .get(&format!("{}{}", group, ALPHA_SUFFIX))
        .map(tensor_utils::scalar_f64)
        .transpose()?;

    Ok(Extracted::Pair(LoraPair::new(
        group,
        convention,
        down.clone(),
        up.clone(),
        alpha,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    fn adapter(entries: &[(&str, Tensor)]) -> WeightSet {
        entries
            .iter()
            .map(|(k, t)| (k.to_string(), t.clone()))
            .collect()
    }

    #[test]
    fn test_group_ids_both_conventions() {
        let set = adapter(&[
            ("lora_unet_a.lora_down.weight", zeros(&[2, 4])),
            ("lora_unet_a.lora_up.weight", zeros(&[4, 2])),
            ("lora_unet_a.alpha", zeros(&[])),
            ("blocks.0.to_q.lora_A.weight", zeros(&[2, 4])),
            ("blocks.0.to_q.lora_B.weight", zeros(&[4, 2])),
            ("orphan.lora_up.weight", zeros(&[4, 2])),
        ]);

        let ids: Vec<String> = group_ids(&set).into_iter().collect();
        assert_eq!(ids, vec!["blocks.0.to_q", "lora_unet_a"]);
    }

    #[test]
    fn test_non_weight_down_entries_are_ignored() {
        let set = adapter(&[("a.lora_down.bias", zeros(&[2]))]);
        assert!(group_ids(&set).is_empty());
    }

    #[test]
    fn test_extract_reads_alpha() {
        let set = adapter(&[
            ("g.lora_down.weight", zeros(&[2, 4])),
            ("g.lora_up.weight", zeros(&[4, 2])),
            ("g.alpha", Tensor::new(8f32, &Device::Cpu).unwrap()),
        ]);

        match extract_pair(&set, "g").unwrap() {
            Extracted::Pair(pair) => {
                assert_eq!(pair.convention, FactorConvention::DownUp);
                assert_eq!(pair.alpha, Some(8.0));
                assert_eq!(pair.rank(), 2);
            }
            other => panic!("expected pair, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_without_alpha() {
        let set = adapter(&[
            ("g.lora_A.weight", zeros(&[3, 4])),
            ("g.lora_B.weight", zeros(&[4, 3])),
        ]);

        match extract_pair(&set, "g").unwrap() {
            Extracted::Pair(pair) => {
                assert_eq!(pair.convention, FactorConvention::AB);
                assert_eq!(pair.alpha, None);
                assert_eq!(pair.alpha(), 3.0);
            }
            other => panic!("expected pair, got {:?}", other),
        }
    }

    #[test]
    fn test_down_up_preferred_over_ab() {
        let set = adapter(&[
            ("g.lora_down.weight", zeros(&[2, 4])),
            ("g.lora_up.weight", zeros(&[4, 2])),
            ("g.lora_A.weight", zeros(&[3, 4])),
            ("g.lora_B.weight", zeros(&[4, 3])),
        ]);

        match extract_pair(&set, "g").unwrap() {
            Extracted::Pair(pair) => assert_eq!(pair.rank(), 2),
            other => panic!("expected pair, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_up() {
        let set = adapter(&[("g.lora_A.weight", zeros(&[2, 4]))]);
        assert!(matches!(
            extract_pair(&set, "g").unwrap(),
            Extracted::MissingUp {
                convention: FactorConvention::AB
            }
        ));
    }

    #[test]
    fn test_missing_down() {
        let set = adapter(&[("g.lora_up.weight", zeros(&[4, 2]))]);
        assert!(matches!(extract_pair(&set, "g").unwrap(), Extracted::MissingDown));
    }

    #[test]
    fn test_vector_alpha_is_an_error() {
        let set = adapter(&[
            ("g.lora_down.weight", zeros(&[2, 4])),
            ("g.lora_up.weight", zeros(&[4, 2])),
            ("g.alpha", zeros(&[2])),
        ]);
        assert!(extract_pair(&set, "g").is_err());
    }
}
