//! Recursive configuration merge
//!
//! Mappings merge by key; every other value type overwrites. This is the one
//! merge rule used everywhere a device profile or a remote reload is applied
//! over the server defaults.

use serde_json::Value;

use crate::{ConfigError, GatewayConfig};

/// Merge `overlay` into `base` in place.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Apply an untyped overlay (e.g. a device profile) to a typed config.
///
/// The overlay may carry keys the typed tree does not model; those land in
/// `extra` via the flatten round-trip.
pub fn merge_config(base: &GatewayConfig, overlay: Value) -> Result<GatewayConfig, ConfigError> {
    let mut tree =
        serde_json::to_value(base).map_err(|e| ConfigError::Parse(e.to_string()))?;
    merge_values(&mut tree, overlay);
    serde_json::from_value(tree).map_err(|e| ConfigError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_overlay_is_identity() {
        let base = GatewayConfig::default();
        let merged = merge_config(&base, json!({})).unwrap();
        assert_eq!(
            serde_json::to_value(&base).unwrap(),
            serde_json::to_value(&merged).unwrap()
        );
    }

    #[test]
    fn nested_override_touches_only_its_path() {
        let base = GatewayConfig::default();
        let merged = merge_config(
            &base,
            json!({ "tts": { "frame_duration_ms": 20 } }),
        )
        .unwrap();

        assert_eq!(merged.tts.frame_duration_ms, 20);
        assert_eq!(merged.tts.pre_buffer_frames, base.tts.pre_buffer_frames);
        assert_eq!(merged.vad.threshold, base.vad.threshold);
    }

    #[test]
    fn scalars_and_arrays_overwrite() {
        let mut base = json!({ "a": { "b": [1, 2], "c": 1 }, "d": "x" });
        merge_values(&mut base, json!({ "a": { "b": [3] }, "d": "y" }));
        assert_eq!(base, json!({ "a": { "b": [3], "c": 1 }, "d": "y" }));
    }

    #[test]
    fn unknown_keys_survive_the_merge() {
        let base = GatewayConfig::default();
        let merged = merge_config(&base, json!({ "plugins": { "weather": true } })).unwrap();
        assert_eq!(
            merged.get_path("plugins.weather"),
            Some(Value::Bool(true))
        );
    }
}
