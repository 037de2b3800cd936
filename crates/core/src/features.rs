//! Feature payload helpers.
//!
//! A feature map is an opaque JSON object produced by a feature backend.
//! The orchestration core only merges maps and strips backend diagnostics
//! before the payload is stored.

use serde_json::{Map, Value};

/// Computed features for one study, keyed by feature name.
pub type FeatureMap = Map<String, Value>;

/// Key prefix backends use for diagnostic (non-feature) entries.
pub const DIAGNOSTICS_PREFIX: &str = "diagnostics";

/// Remove diagnostic entries, recursing into nested objects
/// (modality -> ROI -> feature layouts).
pub fn strip_diagnostics(features: FeatureMap) -> FeatureMap {
    features
        .into_iter()
        .filter(|(key, _)| !key.starts_with(DIAGNOSTICS_PREFIX))
        .map(|(key, value)| match value {
            Value::Object(inner) => (key, Value::Object(strip_diagnostics(inner))),
            other => (key, other),
        })
        .collect()
}

/// Merge `other` into `target`; later families win on key collisions.
pub fn merge_features(target: &mut FeatureMap, other: FeatureMap) {
    for (key, value) in other {
        target.insert(key, value);
    }
}
