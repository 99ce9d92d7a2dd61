// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Feature gate support.
//!
//! Gates are resolved once at startup from the known vocabulary, the
//! configuration file and the command line. The resulting set is frozen.

use std::collections::{BTreeMap, HashMap};

/// Enables the `IAMIdentityMapping` custom resource and its controller.
pub const IAM_IDENTITY_MAPPING_CRD: &str = "IAMIdentityMappingCRD";

/// Error type for feature gate operations.
#[derive(Debug, thiserror::Error)]
pub enum FeatureGateError {
    #[error("unknown feature gate: {0}")]
    UnknownFeature(String),

    #[error("feature gate {0} is locked to its default and cannot be changed")]
    Locked(String),

    #[error("invalid value for feature gate {0}: expected bool, got {1}")]
    InvalidValue(String, String),
}

/// Result type for feature gate operations.
pub type Result<T> = std::result::Result<T, FeatureGateError>;

/// Read access to a resolved set of feature gates.
pub trait FeatureGate: Send + Sync {
    /// Returns true if the given feature gate is enabled.
    fn enabled(&self, feature: &str) -> bool;

    /// Returns all known feature gates and their current values.
    fn all_features(&self) -> HashMap<String, bool>;

    /// Checks if a feature gate exists.
    fn contains(&self, feature: &str) -> bool;
}

/// Maturity of a feature gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Off by default, may change or disappear.
    Alpha,
    /// Always on, cannot be turned off.
    Ga,
}

/// Default state of a known feature gate.
#[derive(Debug, Clone, Copy)]
pub struct FeatureSpec {
    /// Gate name.
    pub name: &'static str,
    /// Value used when nothing overrides it.
    pub default: bool,
    /// Maturity.
    pub stage: Stage,
}

/// Feature gates held in memory.
///
/// Overrides are applied while building; the finished set never changes.
#[derive(Debug, Clone)]
pub struct MemoryFeatureGate {
    known: HashMap<String, FeatureSpec>,
    enabled: HashMap<String, bool>,
}

impl MemoryFeatureGate {
    /// Creates a gate set holding the defaults of `features`.
    pub fn new(features: impl IntoIterator<Item = FeatureSpec>) -> Self {
        let known: HashMap<String, FeatureSpec> = features
            .into_iter()
            .map(|spec| (spec.name.to_string(), spec))
            .collect();
        let enabled = known
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default))
            .collect();

        Self { known, enabled }
    }

    /// Creates a gate set holding this crate's known features at their defaults.
    pub fn with_defaults() -> Self {
        Self::new(known_features().iter().copied())
    }

    /// Applies an override for a single gate.
    pub fn with_override(mut self, feature: &str, enabled: bool) -> Result<Self> {
        let spec = self
            .known
            .get(feature)
            .ok_or_else(|| FeatureGateError::UnknownFeature(feature.to_string()))?;

        if spec.stage == Stage::Ga && enabled != spec.default {
            return Err(FeatureGateError::Locked(feature.to_string()));
        }

        self.enabled.insert(feature.to_string(), enabled);
        Ok(self)
    }

    /// Applies every entry of a name to value map.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, bool>) -> Result<Self> {
        for (name, enabled) in overrides {
            self = self.with_override(name, *enabled)?;
        }
        Ok(self)
    }

    /// Applies overrides from a comma-separated list.
    ///
    /// Format: "Feature1=true,Feature2=false"
    pub fn with_override_string(mut self, s: &str) -> Result<Self> {
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (name, value) = part.split_once('=').ok_or_else(|| {
                FeatureGateError::InvalidValue(part.to_string(), "missing =".to_string())
            })?;

            let enabled = value.trim().parse::<bool>().map_err(|_| {
                FeatureGateError::InvalidValue(name.to_string(), value.to_string())
            })?;

            self = self.with_override(name.trim(), enabled)?;
        }
        Ok(self)
    }
}

impl FeatureGate for MemoryFeatureGate {
    fn enabled(&self, feature: &str) -> bool {
        self.enabled.get(feature).copied().unwrap_or(false)
    }

    fn all_features(&self) -> HashMap<String, bool> {
        self.enabled.clone()
    }

    fn contains(&self, feature: &str) -> bool {
        self.known.contains_key(feature)
    }
}

/// Returns the feature gates understood by this binary.
pub fn known_features() -> &'static [FeatureSpec] {
    &[FeatureSpec {
        name: IAM_IDENTITY_MAPPING_CRD,
        default: false,
        stage: Stage::Alpha,
    }]
}
