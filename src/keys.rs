/// Adapter group → base parameter name resolution
///
/// Adapter tools disagree on naming. A group id such as
/// `lora_unet_transformer_blocks_0_attn_to_q` has to be matched against a
/// base key such as `transformer_blocks.0.attn.to_q.weight`. Resolution walks
/// a fixed, ordered list of naming transforms and stops at the first hit.

use crate::WeightSet;
use serde::{Deserialize, Serialize};

/// Naming conventions on both sides of the mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConvention {
    /// Adapter prefixes removed before matching; the first that matches wins
    pub strip_prefixes: Vec<String>,
    /// Separator used inside adapter group ids
    pub adapter_separator: char,
    /// Separator used inside base parameter names
    pub base_separator: char,
    /// Namespace the base checkpoint nests its parameters under
    pub namespace: String,
    /// Tensor suffix appended when the bare candidate is absent
    pub tensor_suffix: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            strip_prefixes: vec!["lora_unet_".to_string()],
            adapter_separator: '_',
            base_separator: '.',
            namespace: "model.diffusion_model.".to_string(),
            tensor_suffix: ".weight".to_string(),
        }
    }
}

/// One candidate-generating rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingTransform {
    /// Stripped id, untouched
    Raw,
    /// Adapter separator translated to the base separator
    Separated,
    /// Raw id under the base namespace
    Namespaced,
    /// Translated id under the base namespace
    NamespacedSeparated,
}

impl NamingTransform {
    /// Evaluation order; earlier transforms win
    pub const ORDER: [NamingTransform; 4] = [
        NamingTransform::Raw,
        NamingTransform::Separated,
        NamingTransform::Namespaced,
        NamingTransform::NamespacedSeparated,
    ];

    pub fn apply(self, id: &str, naming: &NamingConvention) -> String {
        match self {
            NamingTransform::Raw => id.to_string(),
            NamingTransform::Separated => translate(id, naming),
            NamingTransform::Namespaced => format!("{}{}", naming.namespace, id),
            NamingTransform::NamespacedSeparated => {
                format!("{}{}", naming.namespace, translate(id, naming))
            }
        }
    }
}

fn translate(id: &str, naming: &NamingConvention) -> String {
    id.replace(naming.adapter_separator, &naming.base_separator.to_string())
}

/// A successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Key present in the base weight set
    pub key: String,
    /// Transform that produced it
    pub transform: NamingTransform,
    /// Whether the tensor suffix had to be appended
    pub suffixed: bool,
}

/// Maps adapter group ids onto base parameter names
#[derive(Debug, Clone, Default)]
pub struct KeyResolver {
    naming: NamingConvention,
}

impl KeyResolver {
    pub fn new(naming: NamingConvention) -> Self {
        Self { naming }
    }

    /// Remove the first matching adapter prefix
    pub fn strip<'a>(&self, group: &'a str) -> &'a str {
        self.naming
            .strip_prefixes
            .iter()
            .find_map(|prefix| group.strip_prefix(prefix.as_str()))
            .unwrap_or(group)
    }

    /// Candidate ids in evaluation order, before the suffix probe
    pub fn candidates(&self, group: &str) -> Vec<(NamingTransform, String)> {
        let id = self.strip(group);
        NamingTransform::ORDER
            .iter()
            .map(|t| (*t, t.apply(id, &self.naming)))
            .collect()
    }

    /// Find the base key for `group`, or `None` when no candidate exists
    pub fn resolve(&self, group: &str, base: &WeightSet) -> Option<Resolved> {
        for (transform, candidate) in self.candidates(group) {
            if base.contains_key(&candidate) {
                return Some(Resolved {
                    key: candidate,
                    transform,
                    suffixed: false,
                });
            }

            let suffixed = format!("{}{}", candidate, self.naming.tensor_suffix);
            if base.contains_key(&suffixed) {
                return Some(Resolved {
                    key: suffixed,
                    transform,
                    suffixed: true,
                });
            }
        }
        None
    }
}
