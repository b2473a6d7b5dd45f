//! Launch configuration for the external trainer.
//!
//! This module provides:
//! - Typed launch config mirroring the trainer's dotted override namespace
//! - TOML file parsing
//! - Config deep merge and override validation
//! - Dotted `a.b.c=value` override parsing

use crate::errors::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Dataset-related trainer settings (the `data.*` namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_files: PathBuf,
    pub val_files: PathBuf,
    pub format_prompt: PathBuf,
    pub mini_rollout_batch_size: u32,
}

/// Actor settings (the `worker.actor.*` namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    pub model_path: String,
    pub clip_ratio_low: f64,
    pub clip_ratio_high: f64,
}

/// Keyword arguments passed to the batch reward function.
///
/// Serialized as a single compact JSON literal on the trainer command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardKwargs {
    pub max_response_length: u32,
    pub overlong_buffer_length: u32,
    pub overlong_penalty_factor: f64,
    #[serde(default = "default_format_weight")]
    pub format_weight: f64,
}

fn default_format_weight() -> f64 {
    0.2
}

/// Reward settings (the `worker.reward.*` namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    /// `file.py:function` reference loaded by the trainer
    pub reward_function: String,
    pub reward_function_kwargs: RewardKwargs,
}

/// Worker settings (the `worker.*` namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub actor: ActorConfig,
    pub reward: RewardConfig,
}

/// Algorithm-level flags (the `algorithm.*` namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    pub disable_kl: bool,
    pub online_filtering: bool,
}

/// Trainer bookkeeping (the `trainer.*` namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub experiment_name: String,
    pub n_gpus_per_node: u32,
}

/// Full launch configuration for one trainer invocation.
///
/// Field declaration order is the order override tokens are emitted in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Base trainer config file (YAML, consumed by the trainer, not parsed here)
    pub config: PathBuf,
    /// Python interpreter override; `python3` from PATH when unset
    #[serde(default)]
    pub python: Option<String>,
    pub data: DataConfig,
    pub worker: WorkerConfig,
    pub algorithm: AlgorithmConfig,
    pub trainer: TrainerConfig,
}

/// A parsed `file.py:function` reward-function reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardFunctionRef {
    pub file: PathBuf,
    pub function: String,
}

impl RewardFunctionRef {
    /// Parse a `file.py:function` reference.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let (file, function) = raw.split_once(':').ok_or_else(|| {
            CoreError::config(format!(
                "reward_function must be file.py:function, got '{}'",
                raw
            ))
        })?;
        if !file.ends_with(".py") {
            return Err(CoreError::config(format!(
                "reward_function file must be a .py file, got '{}'",
                file
            )));
        }
        if function.trim().is_empty() {
            return Err(CoreError::config(format!(
                "reward_function is missing a function name: '{}'",
                raw
            )));
        }
        Ok(Self {
            file: PathBuf::from(file),
            function: function.trim().to_string(),
        })
    }
}

impl std::fmt::Display for RewardFunctionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.function)
    }
}

impl LaunchConfig {
    /// Load a launch config from a TOML file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let value = load_toml(path)?;
        serde_json::from_value(value)
            .map_err(|e| CoreError::config(format!("invalid launch config: {}", e)))
    }

    /// Apply dotted `key=value` override tokens on top of this config.
    ///
    /// Each token is validated against the config's own namespace first, so
    /// typos surface with the full dotted path instead of silently creating
    /// keys the trainer never reads.
    pub fn apply_overrides(&self, tokens: &[String]) -> CoreResult<Self> {
        let mut base = serde_json::to_value(self)?;
        for token in tokens {
            let parsed = parse_override(token)?;
            validate_overrides(&base, &parsed, "")?;
            deep_merge(&mut base, &parsed);
        }
        serde_json::from_value(base)
            .map_err(|e| CoreError::config(format!("invalid override value: {}", e)))
    }

    /// Parse the reward-function reference out of this config.
    pub fn reward_function_ref(&self) -> CoreResult<RewardFunctionRef> {
        RewardFunctionRef::parse(&self.worker.reward.reward_function)
    }

    /// Semantic validation of hyperparameters and, optionally, referenced files.
    pub fn validate(&self, check_files: bool) -> CoreResult<()> {
        let actor = &self.worker.actor;
        if actor.clip_ratio_low <= 0.0 {
            return Err(CoreError::validation(format!(
                "worker.actor.clip_ratio_low must be positive, got {}",
                actor.clip_ratio_low
            )));
        }
        if actor.clip_ratio_high <= 0.0 {
            return Err(CoreError::validation(format!(
                "worker.actor.clip_ratio_high must be positive, got {}",
                actor.clip_ratio_high
            )));
        }
        if actor.clip_ratio_low > actor.clip_ratio_high {
            return Err(CoreError::validation(format!(
                "worker.actor.clip_ratio_low ({}) must not exceed clip_ratio_high ({})",
                actor.clip_ratio_low, actor.clip_ratio_high
            )));
        }
        if self.data.mini_rollout_batch_size < 1 {
            return Err(CoreError::validation(
                "data.mini_rollout_batch_size must be >= 1".to_string(),
            ));
        }
        if self.trainer.n_gpus_per_node < 1 {
            return Err(CoreError::validation(
                "trainer.n_gpus_per_node must be >= 1".to_string(),
            ));
        }

        let kwargs = &self.worker.reward.reward_function_kwargs;
        if kwargs.overlong_buffer_length > kwargs.max_response_length {
            return Err(CoreError::validation(format!(
                "worker.reward.reward_function_kwargs.overlong_buffer_length ({}) must not exceed max_response_length ({})",
                kwargs.overlong_buffer_length, kwargs.max_response_length
            )));
        }
        if !(0.0..=1.0).contains(&kwargs.format_weight) {
            return Err(CoreError::validation(format!(
                "worker.reward.reward_function_kwargs.format_weight must be in [0, 1], got {}",
                kwargs.format_weight
            )));
        }

        let reward_ref = self.reward_function_ref()?;
        if check_files {
            let referenced: [(&str, &Path); 5] = [
                ("config", self.config.as_path()),
                ("data.train_files", self.data.train_files.as_path()),
                ("data.val_files", self.data.val_files.as_path()),
                ("data.format_prompt", self.data.format_prompt.as_path()),
                ("worker.reward.reward_function", reward_ref.file.as_path()),
            ];
            for (field, path) in referenced {
                if !path.exists() {
                    return Err(CoreError::validation(format!(
                        "{} references missing file: {}",
                        field,
                        path.display()
                    )));
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// TOML Parsing
// =============================================================================

/// Load a TOML file and convert to JSON Value.
pub fn load_toml(path: &Path) -> CoreResult<Value> {
    let content = fs::read_to_string(path)
        .map_err(|e| CoreError::config(format!("failed to read TOML file: {}", e)))?;

    parse_toml(&content)
}

/// Parse a TOML string to JSON Value.
pub fn parse_toml(content: &str) -> CoreResult<Value> {
    let toml_value: toml::Value = toml::from_str(content)
        .map_err(|e| CoreError::config(format!("failed to parse TOML: {}", e)))?;

    toml_to_json(toml_value)
}

fn toml_to_json(toml: toml::Value) -> CoreResult<Value> {
    match toml {
        toml::Value::String(s) => Ok(Value::String(s)),
        toml::Value::Integer(i) => Ok(Value::Number(i.into())),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| CoreError::config("invalid float value".to_string())),
        toml::Value::Boolean(b) => Ok(Value::Bool(b)),
        toml::Value::Datetime(dt) => Ok(Value::String(dt.to_string())),
        toml::Value::Array(arr) => {
            let json_arr: CoreResult<Vec<Value>> = arr.into_iter().map(toml_to_json).collect();
            Ok(Value::Array(json_arr?))
        }
        toml::Value::Table(table) => {
            let mut map = Map::new();
            for (k, v) in table {
                map.insert(k, toml_to_json(v)?);
            }
            Ok(Value::Object(map))
        }
    }
}

// =============================================================================
// Deep Merge
// =============================================================================

/// Deep merge two JSON values.
///
/// For objects, keys from `overrides` replace or add to `base`.
/// For other types, `overrides` completely replaces `base`.
pub fn deep_merge(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            for (key, override_val) in override_map {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge(base_val, override_val);
                } else {
                    base_map.insert(key.clone(), override_val.clone());
                }
            }
        }
        (base, overrides) => {
            *base = overrides.clone();
        }
    }
}

/// Validate that all override keys exist in the base config.
///
/// This helps catch typos in override tokens before they reach the trainer.
pub fn validate_overrides(base: &Value, overrides: &Value, path: &str) -> CoreResult<()> {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            for (key, override_val) in override_map {
                let key_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };

                if let Some(base_val) = base_map.get(key) {
                    validate_overrides(base_val, override_val, &key_path)?;
                } else {
                    return Err(CoreError::config(format!(
                        "unknown config key: {}",
                        key_path
                    )));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// =============================================================================
// Override Token Parsing
// =============================================================================

/// Parse one `a.b.c=value` override token into a nested JSON value.
///
/// Scalars are auto-typed (bool, integer, float); values that parse as JSON
/// objects or arrays are kept as JSON; everything else stays a string.
pub fn parse_override(token: &str) -> CoreResult<Value> {
    let (key, raw) = token.split_once('=').ok_or_else(|| {
        CoreError::invalid_input(format!("override must be key=value, got '{}'", token))
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(CoreError::invalid_input(format!(
            "override has empty key: '{}'",
            token
        )));
    }

    let mut value = parse_override_value(raw);
    for part in key.rsplit('.') {
        if part.is_empty() {
            return Err(CoreError::invalid_input(format!(
                "override has empty path segment: '{}'",
                key
            )));
        }
        let mut map = Map::new();
        map.insert(part.to_string(), value);
        value = Value::Object(map);
    }
    Ok(value)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str(trimmed) {
            return v;
        }
    }
    Value::String(trimmed.to_string())
}

#[cfg(test)]
pub(crate) const SAMPLE_TOML: &str = r#"
        config = "trainer/dapo.yaml"

        [data]
        train_files = "data/train.jsonl"
        val_files = "data/val.jsonl"
        format_prompt = "prompts/scene_graph.jinja"
        mini_rollout_batch_size = 128

        [worker.actor]
        model_path = "Qwen/Qwen2.5-VL-7B-Instruct"
        clip_ratio_low = 0.2
        clip_ratio_high = 0.28

        [worker.reward]
        reward_function = "rewards/dapo_graph.py:compute_score"

        [worker.reward.reward_function_kwargs]
        max_response_length = 2048
        overlong_buffer_length = 512
        overlong_penalty_factor = 1.0
        format_weight = 0.2

        [algorithm]
        disable_kl = true
        online_filtering = true

        [trainer]
        experiment_name = "qwen2_5_vl_7b_scene_graph"
        n_gpus_per_node = 8
    "#;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample_config() -> LaunchConfig {
        let value = parse_toml(SAMPLE_TOML).unwrap();
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [trainer]
            experiment_name = "exp1"
            n_gpus_per_node = 8

            [worker.actor]
            clip_ratio_low = 0.2
        "#;

        let result = parse_toml(toml).unwrap();
        assert_eq!(result["trainer"]["experiment_name"], "exp1");
        assert_eq!(result["trainer"]["n_gpus_per_node"], 8);
        assert_eq!(result["worker"]["actor"]["clip_ratio_low"], 0.2);
    }

    #[test]
    fn test_load_full_config() {
        let cfg = sample_config();
        assert_eq!(cfg.trainer.experiment_name, "qwen2_5_vl_7b_scene_graph");
        assert_eq!(cfg.data.mini_rollout_batch_size, 128);
        assert!((cfg.worker.actor.clip_ratio_high - 0.28).abs() < 1e-12);
        assert!(cfg.algorithm.disable_kl);
        assert!(cfg.python.is_none());
        cfg.validate(false).unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE_TOML.as_bytes()).unwrap();
        let cfg = LaunchConfig::load(file.path()).unwrap();
        assert_eq!(cfg.trainer.n_gpus_per_node, 8);
    }

    #[test]
    fn test_deep_merge_objects() {
        let mut base = json!({
            "a": 1,
            "b": {
                "c": 2,
                "d": 3
            }
        });
        let overrides = json!({
            "b": {
                "c": 99
            },
            "e": 4
        });

        deep_merge(&mut base, &overrides);

        assert_eq!(base["a"], 1);
        assert_eq!(base["b"]["c"], 99);
        assert_eq!(base["b"]["d"], 3);
        assert_eq!(base["e"], 4);
    }

    #[test]
    fn test_deep_merge_replace() {
        let mut base = json!({ "a": [1, 2, 3] });
        let overrides = json!({ "a": [4, 5] });

        deep_merge(&mut base, &overrides);

        assert_eq!(base["a"], json!([4, 5]));
    }

    #[test]
    fn test_validate_overrides_unknown_key() {
        let base = json!({
            "trainer": {
                "experiment_name": "exp"
            }
        });
        let bad = json!({
            "trainer": {
                "experiment_nam": "typo"
            }
        });
        let err = validate_overrides(&base, &bad, "").unwrap_err();
        assert!(format!("{}", err).contains("trainer.experiment_nam"));
    }

    #[test]
    fn test_parse_override_typing() {
        assert_eq!(
            parse_override("algorithm.disable_kl=true").unwrap(),
            json!({"algorithm": {"disable_kl": true}})
        );
        assert_eq!(
            parse_override("trainer.n_gpus_per_node=4").unwrap(),
            json!({"trainer": {"n_gpus_per_node": 4}})
        );
        assert_eq!(
            parse_override("worker.actor.clip_ratio_high=0.3").unwrap(),
            json!({"worker": {"actor": {"clip_ratio_high": 0.3}}})
        );
        assert_eq!(
            parse_override("trainer.experiment_name=run2").unwrap(),
            json!({"trainer": {"experiment_name": "run2"}})
        );
        assert_eq!(
            parse_override(r#"worker.reward.reward_function_kwargs={"max_response_length":1024,"overlong_buffer_length":128,"overlong_penalty_factor":1.0,"format_weight":0.1}"#)
                .unwrap()["worker"]["reward"]["reward_function_kwargs"]["max_response_length"],
            1024
        );
    }

    #[test]
    fn test_parse_override_rejects_malformed() {
        assert!(parse_override("no_equals_sign").is_err());
        assert!(parse_override("=value").is_err());
        assert!(parse_override("a..b=1").is_err());
    }

    #[test]
    fn test_apply_overrides_roundtrip() {
        let cfg = sample_config();
        let updated = cfg
            .apply_overrides(&[
                "trainer.n_gpus_per_node=4".to_string(),
                "worker.actor.clip_ratio_high=0.3".to_string(),
            ])
            .unwrap();
        assert_eq!(updated.trainer.n_gpus_per_node, 4);
        assert!((updated.worker.actor.clip_ratio_high - 0.3).abs() < 1e-12);
        // Untouched fields survive the merge
        assert_eq!(updated.data.mini_rollout_batch_size, 128);
    }

    #[test]
    fn test_apply_overrides_rejects_unknown_path() {
        let cfg = sample_config();
        let err = cfg
            .apply_overrides(&["worker.actor.clip_ratio=0.3".to_string()])
            .unwrap_err();
        assert!(format!("{}", err).contains("worker.actor.clip_ratio"));
    }

    #[test]
    fn test_reward_function_ref() {
        let reward =
            RewardFunctionRef::parse("rewards/dapo_graph.py:compute_score").unwrap();
        assert_eq!(reward.file, PathBuf::from("rewards/dapo_graph.py"));
        assert_eq!(reward.function, "compute_score");
        assert_eq!(
            reward.to_string(),
            "rewards/dapo_graph.py:compute_score"
        );

        assert!(RewardFunctionRef::parse("rewards/dapo_graph.py").is_err());
        assert!(RewardFunctionRef::parse("rewards/dapo_graph.sh:run").is_err());
        assert!(RewardFunctionRef::parse("rewards/dapo_graph.py:").is_err());
    }

    #[test]
    fn test_validate_clip_ratios() {
        let mut cfg = sample_config();
        cfg.worker.actor.clip_ratio_low = 0.5;
        cfg.worker.actor.clip_ratio_high = 0.2;
        let err = cfg.validate(false).unwrap_err();
        assert!(format!("{}", err).contains("clip_ratio_low"));

        cfg.worker.actor.clip_ratio_low = -0.1;
        assert!(cfg.validate(false).is_err());
    }

    #[test]
    fn test_validate_reward_kwargs() {
        let mut cfg = sample_config();
        cfg.worker.reward.reward_function_kwargs.overlong_buffer_length = 4096;
        assert!(cfg.validate(false).is_err());

        let mut cfg = sample_config();
        cfg.worker.reward.reward_function_kwargs.format_weight = 1.5;
        assert!(cfg.validate(false).is_err());
    }

    #[test]
    fn test_validate_missing_files() {
        let cfg = sample_config();
        let err = cfg.validate(true).unwrap_err();
        assert!(format!("{}", err).contains("missing file"));
    }

    #[test]
    fn test_reward_kwargs_exact_keys() {
        let cfg = sample_config();
        let rendered =
            serde_json::to_value(&cfg.worker.reward.reward_function_kwargs).unwrap();
        let obj = rendered.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        for key in [
            "max_response_length",
            "overlong_buffer_length",
            "overlong_penalty_factor",
            "format_weight",
        ] {
            assert!(obj.contains_key(key), "missing kwargs key {}", key);
        }
    }
}
