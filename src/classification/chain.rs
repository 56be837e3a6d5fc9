use std::collections::{BTreeSet, HashMap};

use anyhow::anyhow;
use serde::Deserialize;

use super::scheme::ClassificationScheme;
use crate::geofile::feature::Feature;

/// Free-text attributes that carry chain identity.
pub const CHAIN_ATTRIBUTES: [&str; 3] = ["name", "brand", "operator"];

/// Whether chain names are counted over all cities of a run or per city.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ChainScope {
    #[default]
    Global,
    PerCity,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainDetectionConfig {
    /// Class_A whose features are checked for chain identity.
    pub category: String,
    /// Class_A assigned to features of `category` that are not chains.
    pub fallback_category: String,
    /// A normalized string occurring at least this often is a major chain name.
    pub min_occurrences: usize,
    /// Features with a value for this attribute are exempt from reclassification.
    pub exempt_attribute: String,
    pub scope: ChainScope,
}

impl Default for ChainDetectionConfig {
    fn default() -> Self {
        Self {
            category: "Supermarket".to_string(),
            fallback_category: "Food Store".to_string(),
            min_occurrences: 5,
            exempt_attribute: "origin".to_string(),
            scope: ChainScope::Global,
        }
    }
}

impl ChainDetectionConfig {
    /// Both categories must be known to the scheme, otherwise reclassification could not
    /// derive Class_B/Class_C for the fallback.
    pub fn validate(&self, scheme: &ClassificationScheme) -> anyhow::Result<()> {
        for class_a in [&self.category, &self.fallback_category] {
            if scheme.category_path(class_a).is_none() {
                return Err(anyhow!(
                    "Chain detection category '{}' is not an active Class_A of the classification scheme",
                    class_a
                ));
            }
        }
        Ok(())
    }

    /// Features subject to chain detection: classified as `category` and not exempt.
    pub fn is_candidate(&self, feature: &Feature) -> bool {
        feature.class_a() == Some(self.category.as_str())
            && feature.attribute(&self.exempt_attribute).is_none()
    }
}

/// Lower-case and collapse whitespace runs to single spaces.
pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .to_lowercase()
}

fn chain_values(feature: &Feature) -> impl Iterator<Item = String> + '_ {
    CHAIN_ATTRIBUTES
        .iter()
        .filter_map(|key| feature.attribute(key))
        .map(normalize_text)
        .filter(|value| !value.is_empty())
}

/// Occurrence counts of normalized name/brand/operator strings over candidate features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainFrequencies {
    counts: HashMap<String, usize>,
}

impl ChainFrequencies {
    pub fn from_features<'a>(
        features: impl IntoIterator<Item = &'a Feature>,
        config: &ChainDetectionConfig,
    ) -> Self {
        let mut counts = HashMap::new();
        for feature in features {
            if !config.is_candidate(feature) {
                continue;
            }
            for value in chain_values(feature) {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
        Self { counts }
    }

    pub fn merge(&mut self, other: &ChainFrequencies) {
        for (value, count) in &other.counts {
            *self.counts.entry(value.clone()).or_insert(0) += count;
        }
    }

    #[cfg(test)]
    pub fn count(&self, value: &str) -> usize {
        self.counts.get(value).copied().unwrap_or(0)
    }

    pub fn major_chains(&self, min_occurrences: usize) -> MajorChains {
        MajorChains {
            names: self
                .counts
                .iter()
                .filter(|(_, count)| **count >= min_occurrences)
                .map(|(value, _)| value.clone())
                .collect(),
        }
    }
}

/// The finalized set of major chain names, shared read-only between cities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MajorChains {
    names: BTreeSet<String>,
}

impl MajorChains {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// True if the normalized value starts with a chain name that is followed by the end of
    /// the value or a non-alphanumeric character.
    pub fn matches(&self, value: &str) -> bool {
        self.names.iter().any(|name| {
            value.starts_with(name.as_str())
                && value[name.len()..]
                    .chars()
                    .next()
                    .map_or(true, |next| !next.is_alphanumeric())
        })
    }

    pub fn is_chain_feature(&self, feature: &Feature) -> bool {
        chain_values(feature).any(|value| self.matches(&value))
    }
}

/// Move candidate features that show no chain identity to the fallback category. Returns the
/// number of reclassified features.
pub fn reclassify_independents(
    features: &mut [Feature],
    chains: &MajorChains,
    config: &ChainDetectionConfig,
    scheme: &ClassificationScheme,
) -> anyhow::Result<usize> {
    let fallback = scheme
        .category_path(&config.fallback_category)
        .ok_or_else(|| {
            anyhow!(
                "Fallback category '{}' is not part of the classification scheme",
                config.fallback_category
            )
        })?;
    let mut num_reclassified = 0;
    for feature in features.iter_mut() {
        if config.is_candidate(feature) && !chains.is_chain_feature(feature) {
            log::trace!(
                "Reclassifying {} from {} to {}",
                feature.id,
                config.category,
                fallback.class_a
            );
            feature.category = Some(fallback.clone());
            num_reclassified += 1;
        }
    }
    Ok(num_reclassified)
}
