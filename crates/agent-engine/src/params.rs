//! Parameter-context construction (resolved values bound onto the workflow
//! graph): required-input validation, seed normalisation, primary-LoRA
//! strength derivation, and the workflow-defaults/extra merge.

use agent_core::JobParameters;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Keys the caller's `extra` map may never set directly; they are derived
/// by the engine itself from validated/generated inputs.
const RESERVED_EXTRA_KEYS: &[&str] = &["prompt", "seed", "steps", "width", "height", "cfg_scale"];

/// Fields expected to end up numeric after the defaults/extra merge.
const NUMERIC_FIELDS: &[&str] = &["cfg_scale", "steps", "width", "height", "seed"];

/// Failures building or validating the resolved parameter context.
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    /// One or more required inputs were missing or failed validation.
    #[error("invalid job parameters: {0}")]
    Invalid(String),
    /// `extra` attempted to set a reserved key.
    #[error("extra parameters may not override reserved keys: {0}")]
    ReservedKeyOverride(String),
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `|seed| mod 10^9`.
pub fn normalize_seed(seed: i64) -> i64 {
    seed.unsigned_abs() as i64 % 1_000_000_000
}

/// Generate a seed via a cryptographically-seeded RNG (UUID v4's entropy
/// source), normalised the same way a user-supplied seed would be.
pub fn generate_seed() -> i64 {
    let bytes = Uuid::new_v4().into_bytes();
    let raw = u64::from_be_bytes(bytes[0..8].try_into().expect("uuid is 16 bytes"));
    (raw % 1_000_000_000) as i64
}

/// Clamp to `[-2.0, 2.0]` and round to 2 decimal places.
pub fn normalize_lora_strength(value: f64) -> f64 {
    round2(value.clamp(-2.0, 2.0))
}

/// Read LoRA strength from object-store metadata, preferring
/// `strength_model` > `strength_clip` > `strength`, defaulting to `1.0`.
pub fn derive_lora_strength(metadata: &BTreeMap<String, String>, keys: &[&str]) -> f64 {
    for key in keys {
        if let Some(raw) = metadata.get(*key) {
            if let Ok(parsed) = raw.trim().parse::<f64>() {
                return normalize_lora_strength(parsed);
            }
        }
    }
    1.0
}

/// A resolved LoRA's display name plus the object-store metadata used to
/// derive its per-lora strength fields.
pub struct LoraInput<'a> {
    /// Visible display name bound onto the workflow's LoRA chain.
    pub display_name: &'a str,
    /// Object-store user metadata for this LoRA (`strength_model`, etc).
    pub metadata: &'a BTreeMap<String, String>,
}

/// Build the fully resolved parameter context: validates required inputs,
/// normalises/generates the seed, derives primary-LoRA fields, and merges
/// `workflow_defaults` then `parameters.extra` over the engine-seeded core.
///
/// # Errors
///
/// Returns [`ParamError::Invalid`] aggregating every missing/invalid
/// required input or post-merge validation failure, or
/// [`ParamError::ReservedKeyOverride`] if `extra` sets a reserved key.
pub fn build_parameter_context(
    parameters: &JobParameters,
    base_model_display_name: &str,
    loras: &[LoraInput<'_>],
    workflow_defaults: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, ParamError> {
    let mut problems = Vec::new();

    if parameters.prompt.trim().is_empty() {
        problems.push("prompt must not be empty".to_string());
    }
    let steps = match parameters.steps {
        Some(steps) if steps > 0 => steps,
        Some(_) => {
            problems.push("steps must be > 0".to_string());
            0
        }
        None => {
            problems.push("steps is required".to_string());
            0
        }
    };
    let cfg_scale = match parameters.cfg_scale {
        Some(cfg) if cfg > 0.0 => round2(cfg),
        Some(_) => {
            problems.push("cfgScale must be > 0".to_string());
            0.0
        }
        None => {
            problems.push("cfgScale is required".to_string());
            0.0
        }
    };
    let resolution = match &parameters.resolution {
        Some(res) if res.width > 0 && res.height > 0 => *res,
        Some(_) => {
            problems.push("resolution width and height must be > 0".to_string());
            agent_core::Resolution { width: 0, height: 0 }
        }
        None => {
            problems.push("resolution is required".to_string());
            agent_core::Resolution { width: 0, height: 0 }
        }
    };

    if !problems.is_empty() {
        return Err(ParamError::Invalid(problems.join("; ")));
    }

    for key in parameters.extra.keys() {
        if RESERVED_EXTRA_KEYS.contains(&key.as_str()) {
            return Err(ParamError::ReservedKeyOverride(key.clone()));
        }
    }

    let seed = normalize_seed(parameters.seed.unwrap_or_else(generate_seed));

    let mut context = Map::new();
    context.insert("prompt".to_string(), Value::String(parameters.prompt.clone()));
    if let Some(negative) = &parameters.negative_prompt {
        context.insert("negative_prompt".to_string(), Value::String(negative.clone()));
    }
    context.insert("seed".to_string(), Value::from(seed));
    context.insert("cfg_scale".to_string(), number_or_null(cfg_scale));
    context.insert("steps".to_string(), Value::from(steps));
    context.insert("width".to_string(), Value::from(resolution.width));
    context.insert("height".to_string(), Value::from(resolution.height));
    for alias in ["base_model_path", "base_model_name", "base_model_full_path"] {
        context.insert(alias.to_string(), Value::String(base_model_display_name.to_string()));
    }
    context.insert(
        "loras".to_string(),
        Value::Array(loras.iter().map(|l| Value::String(l.display_name.to_string())).collect()),
    );
    if !loras.is_empty() {
        let metadata_entries: Vec<Value> = loras
            .iter()
            .map(|l| {
                Value::Object(
                    l.metadata
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                )
            })
            .collect();
        context.insert("loras_metadata".to_string(), Value::Array(metadata_entries));

        let primary = &loras[0];
        context.insert("primary_lora_name".to_string(), Value::String(primary.display_name.to_string()));
        context.insert(
            "primary_lora_strength_model".to_string(),
            number_or_null(derive_lora_strength(primary.metadata, &["strength_model", "strength_clip", "strength"])),
        );
        context.insert(
            "primary_lora_strength_clip".to_string(),
            number_or_null(derive_lora_strength(primary.metadata, &["strength_clip", "strength_model", "strength"])),
        );
    }

    for (key, value) in workflow_defaults {
        context.insert(key.clone(), value.clone());
    }
    for (key, value) in &parameters.extra {
        context.insert(key.clone(), value.clone());
    }

    context.retain(|_, v| !v.is_null());

    verify_merged_context(&context)?;

    Ok(context.into_iter().collect())
}

fn number_or_null(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn verify_merged_context(context: &Map<String, Value>) -> Result<(), ParamError> {
    let mut problems = Vec::new();

    for key in ["sampler", "scheduler"] {
        match context.get(key).and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => {}
            _ => problems.push(format!("{key} must be a non-empty string")),
        }
    }

    for key in NUMERIC_FIELDS {
        if let Some(value) = context.get(*key) {
            let coercible = match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            };
            if !coercible {
                problems.push(format!("{key} must be numeric"));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ParamError::Invalid(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::Resolution;

    fn base_parameters() -> JobParameters {
        JobParameters {
            prompt: "a cat".to_string(),
            negative_prompt: None,
            seed: Some(7),
            cfg_scale: Some(7.5),
            steps: Some(20),
            resolution: Some(Resolution { width: 512, height: 768 }),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn seed_normalizes_negative_and_large_values() {
        assert_eq!(normalize_seed(-5), 5);
        assert_eq!(normalize_seed(5_000_000_000), 5_000_000_000 % 1_000_000_000);
    }

    #[test]
    fn generated_seed_is_in_range() {
        for _ in 0..20 {
            let seed = generate_seed();
            assert!((0..1_000_000_000).contains(&seed));
        }
    }

    #[test]
    fn lora_strength_prefers_strength_model_over_others() {
        let mut metadata = BTreeMap::new();
        metadata.insert("strength_model".to_string(), "0.6".to_string());
        metadata.insert("strength".to_string(), "0.9".to_string());
        let value = derive_lora_strength(&metadata, &["strength_model", "strength_clip", "strength"]);
        assert_eq!(value, 0.6);
    }

    #[test]
    fn lora_strength_defaults_to_one_when_absent() {
        let metadata = BTreeMap::new();
        assert_eq!(derive_lora_strength(&metadata, &["strength_model", "strength_clip", "strength"]), 1.0);
    }

    #[test]
    fn lora_strength_clamps_out_of_range_values() {
        let mut metadata = BTreeMap::new();
        metadata.insert("strength".to_string(), "5.0".to_string());
        assert_eq!(derive_lora_strength(&metadata, &["strength"]), 2.0);
    }

    #[test]
    fn build_context_rejects_missing_required_fields() {
        let parameters = JobParameters {
            prompt: String::new(),
            negative_prompt: None,
            seed: None,
            cfg_scale: None,
            steps: None,
            resolution: None,
            extra: BTreeMap::new(),
        };
        let err = build_parameter_context(&parameters, "model.safetensors", &[], &BTreeMap::new()).unwrap_err();
        let ParamError::Invalid(message) = err else { panic!("expected Invalid") };
        assert!(message.contains("prompt"));
        assert!(message.contains("steps"));
        assert!(message.contains("cfgScale"));
        assert!(message.contains("resolution"));
    }

    #[test]
    fn build_context_rejects_reserved_key_in_extra() {
        let mut parameters = base_parameters();
        parameters.extra.insert("steps".to_string(), Value::from(99));
        let err = build_parameter_context(&parameters, "model.safetensors", &[], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ParamError::ReservedKeyOverride(key) if key == "steps"));
    }

    #[test]
    fn build_context_rejects_missing_sampler_and_scheduler() {
        let parameters = base_parameters();
        let err = build_parameter_context(&parameters, "model.safetensors", &[], &BTreeMap::new()).unwrap_err();
        let ParamError::Invalid(message) = err else { panic!("expected Invalid") };
        assert!(message.contains("sampler"));
        assert!(message.contains("scheduler"));
    }

    #[test]
    fn build_context_permits_sampler_and_scheduler_in_extra() {
        let mut parameters = base_parameters();
        parameters.extra.insert("sampler".to_string(), Value::String("euler".to_string()));
        parameters.extra.insert("scheduler".to_string(), Value::String("karras".to_string()));
        let context = build_parameter_context(&parameters, "model.safetensors", &[], &BTreeMap::new()).unwrap();
        assert_eq!(context["sampler"], Value::String("euler".to_string()));
        assert_eq!(context["scheduler"], Value::String("karras".to_string()));
    }

    #[test]
    fn build_context_rejects_blank_sampler_after_merge() {
        let mut parameters = base_parameters();
        parameters.extra.insert("sampler".to_string(), Value::String("   ".to_string()));
        let err = build_parameter_context(&parameters, "model.safetensors", &[], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ParamError::Invalid(_)));
    }

    #[test]
    fn build_context_seeds_base_model_aliases_and_lora_list() {
        let mut parameters = base_parameters();
        parameters.extra.insert("sampler".to_string(), Value::String("euler".to_string()));
        parameters.extra.insert("scheduler".to_string(), Value::String("karras".to_string()));
        let mut metadata = BTreeMap::new();
        metadata.insert("strength_model".to_string(), "0.8".to_string());
        let loras = vec![LoraInput { display_name: "style.safetensors", metadata: &metadata }];
        let context = build_parameter_context(&parameters, "sdxl.safetensors", &loras, &BTreeMap::new()).unwrap();
        assert_eq!(context["base_model_path"], Value::String("sdxl.safetensors".to_string()));
        assert_eq!(context["base_model_name"], Value::String("sdxl.safetensors".to_string()));
        assert_eq!(context["loras"], Value::Array(vec![Value::String("style.safetensors".to_string())]));
        assert_eq!(context["primary_lora_name"], Value::String("style.safetensors".to_string()));
        assert_eq!(context["primary_lora_strength_model"], Value::from(0.8));
    }

    #[test]
    fn workflow_defaults_are_overridden_by_extra() {
        let mut parameters = base_parameters();
        parameters.extra.insert("sampler".to_string(), Value::String("dpmpp_2m".to_string()));
        let mut defaults = BTreeMap::new();
        defaults.insert("sampler".to_string(), Value::String("euler".to_string()));
        defaults.insert("scheduler".to_string(), Value::String("karras".to_string()));
        let context = build_parameter_context(&parameters, "model.safetensors", &[], &defaults).unwrap();
        assert_eq!(context["sampler"], Value::String("dpmpp_2m".to_string()));
    }
}
