//! # Server Configuration
//!
//! Configuration is one JSON document. Each service reads its own
//! top-level section (`jobs` for the job queue) from the
//! [`AppContext`](dog_jobs::AppContext) built out of it.
//!
//! ## Environment overrides
//! Variables starting with [`ENV_PREFIX`] override single keys. The rest
//! of the name is lower-cased and split on `__`:
//!
//! ```bash
//! export DOG__JOBS__PIPELINES__EMAILS__CONCURRENCY=8   # jobs.pipelines.emails.concurrency
//! ```
//!
//! Values are parsed as JSON when they parse, otherwise kept as strings,
//! so `8` is a number, `true` a boolean and `30s` a string.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "DOG__";

/// Variable naming the config file when no argument is given
pub const CONFIG_PATH_VAR: &str = "DOG_JOBS_CONFIG";

#[derive(Debug, Clone, PartialEq)]
pub struct DogConfig {
    values: Value,
}

impl Default for DogConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DogConfig {
    /// Create an empty config document.
    pub fn new() -> Self {
        Self {
            values: Value::Object(Map::new()),
        }
    }

    pub fn from_value(values: Value) -> Result<Self> {
        anyhow::ensure!(values.is_object(), "configuration root must be a JSON object");
        Ok(Self { values })
    }

    /// Load the document at `path`, or start empty when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::new());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let values = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Self::from_value(values)
    }

    /// Set a dotted key, creating intermediate objects as needed.
    ///
    /// Example: config.set("jobs.grace_period", json!("10s"))
    pub fn set(&mut self, key: &str, value: Value) {
        let mut node = &mut self.values;
        for segment in key.split('.') {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
                _ => return,
            };
        }
        *node = value;
    }

    /// Get a dotted key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.').try_fold(&self.values, |node, segment| node.get(segment))
    }

    /// Apply every `prefix`-ed variable as an override; returns how many applied.
    pub fn apply_env<I>(&mut self, prefix: &str, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut applied = 0;
        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(prefix) else {
                continue;
            };
            if stripped.is_empty() {
                continue;
            }

            let normalized = stripped.to_lowercase().replace("__", ".");
            self.set(&normalized, parse_value(&value));
            applied += 1;
        }
        applied
    }

    pub fn as_value(&self) -> &Value {
        &self.values
    }

    pub fn into_value(self) -> Value {
        self.values
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Config file from the first argument, else from [`CONFIG_PATH_VAR`]
pub fn config_path(arg: Option<String>, var: Option<String>) -> Option<PathBuf> {
    arg.or(var).filter(|path| !path.is_empty()).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_nested_keys() {
        let mut config = DogConfig::from_value(json!({
            "jobs": { "pipelines": { "emails": { "broker": "local", "concurrency": 1 } } }
        }))
        .unwrap();

        let applied = config.apply_env(
            ENV_PREFIX,
            vars(&[
                ("DOG__JOBS__PIPELINES__EMAILS__CONCURRENCY", "8"),
                ("DOG__JOBS__GRACE_PERIOD", "10s"),
                ("PATH", "/usr/bin"),
            ]),
        );

        assert_eq!(applied, 2);
        assert_eq!(config.get("jobs.pipelines.emails.concurrency"), Some(&json!(8)));
        assert_eq!(config.get("jobs.pipelines.emails.broker"), Some(&json!("local")));
        assert_eq!(config.get("jobs.grace_period"), Some(&json!("10s")));
    }

    #[test]
    fn env_values_parse_as_json_when_possible() {
        let mut config = DogConfig::new();
        config.apply_env(
            ENV_PREFIX,
            vars(&[
                ("DOG__JOBS__CONSUME", r#"["emails","reports"]"#),
                ("DOG__JOBS__RETRY__JITTER", "true"),
            ]),
        );

        assert_eq!(config.get("jobs.consume"), Some(&json!(["emails", "reports"])));
        assert_eq!(config.get("jobs.retry.jitter"), Some(&json!(true)));
    }

    #[test]
    fn set_replaces_scalars_on_the_path() {
        let mut config = DogConfig::from_value(json!({ "jobs": "disabled" })).unwrap();
        config.set("jobs.grace_period", json!("5s"));
        assert_eq!(config.as_value(), &json!({ "jobs": { "grace_period": "5s" } }));
    }

    #[test]
    fn load_reads_json_file() {
        let path = std::env::temp_dir()
            .join(format!("dog-server-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "jobs": { "consume": ["emails"] } }"#).unwrap();

        let config = DogConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.get("jobs.consume"), Some(&json!(["emails"])));
        assert_eq!(DogConfig::load(None).unwrap(), DogConfig::new());
    }

    #[test]
    fn rejects_non_object_root() {
        assert!(DogConfig::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn argument_wins_over_variable() {
        assert_eq!(
            config_path(Some("a.json".into()), Some("b.json".into())),
            Some(PathBuf::from("a.json"))
        );
        assert_eq!(config_path(None, Some("b.json".into())), Some(PathBuf::from("b.json")));
        assert_eq!(config_path(None, Some(String::new())), None);
    }
}
