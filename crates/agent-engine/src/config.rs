//! The YAML job configuration blob: a mapping `name -> { type, job }`.
//!
//! Parsing is entry-tolerant: a malformed entry is skipped (and reported)
//! without taking the rest of the config down.

use serde::{Deserialize, Deserializer};

use crate::api::JobKind;

fn default_language() -> String {
    "bash".to_string()
}

fn default_timeout() -> u64 {
    900
}

fn default_threads() -> usize {
    1
}

fn default_lookback() -> String {
    "2m".to_string()
}

fn default_true() -> bool {
    true
}

/// Accepts YAML booleans plus the legacy `y`/`n` string flags.
fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Text(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Flag(flag) => flag,
        Raw::Text(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "y" | "yes" | "true" | "1"
        ),
    })
}

/// Accepts a digest id written as a number or a string.
fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    }))
}

/// Accepts a tag list written as a comma-separated string or a YAML sequence.
fn de_opt_tags<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        List(Vec<String>),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::List(items) => items.join(","),
    }))
}

/// The `job` body of a config entry. Fields irrelevant to a class are
/// simply unused for it.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JobSpec {
    #[serde(default = "default_language")]
    pub(crate) language: String,

    #[serde(default, deserialize_with = "de_opt_id")]
    pub(crate) logic_digest_id: Option<String>,

    /// Per-execution wall clock limit, seconds.
    #[serde(default = "default_timeout")]
    pub(crate) timeout: u64,

    /// Worker parallelism for task/queue classes.
    #[serde(default = "default_threads")]
    pub(crate) threads: usize,

    /// Source tag of queue work items.
    #[serde(default)]
    pub(crate) queue_tag: Option<String>,

    /// Observation window for queue work, duration grammar.
    #[serde(default = "default_lookback")]
    pub(crate) lookback: String,

    #[serde(default)]
    pub(crate) lock_tag: Option<String>,

    #[serde(default, deserialize_with = "de_opt_tags")]
    pub(crate) done_tags: Option<String>,

    #[serde(default, deserialize_with = "de_opt_tags")]
    pub(crate) fail_tags: Option<String>,

    /// Whether queue items that previously failed fleet-wide stay eligible.
    #[serde(default = "default_true", deserialize_with = "de_flag")]
    pub(crate) retry_failed: bool,

    /// Run interval for task jobs, duration grammar.
    #[serde(default)]
    pub(crate) timing: Option<String>,

    /// Free-text context forwarded with published results.
    #[serde(default)]
    pub(crate) context_prompt: Option<String>,
}

impl JobSpec {
    pub(crate) fn lock_tag(&self, job_name: &str) -> String {
        self.lock_tag
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("{job_name}-lock"))
    }

    pub(crate) fn done_tags(&self, job_name: &str) -> Vec<String> {
        let tags = self.done_tags.as_deref().map(parse_tags).unwrap_or_default();
        if tags.is_empty() {
            vec![format!("{job_name}-done")]
        } else {
            tags
        }
    }

    pub(crate) fn fail_tags(&self, job_name: &str) -> Vec<String> {
        let tags = self.fail_tags.as_deref().map(parse_tags).unwrap_or_default();
        if tags.is_empty() {
            vec![format!("{job_name}-fail")]
        } else {
            tags
        }
    }
}

/// One config entry: the job class plus its body.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JobEntry {
    #[serde(rename = "type")]
    pub(crate) kind: JobKind,
    pub(crate) job: JobSpec,
}

pub(crate) struct ParsedConfig {
    pub(crate) jobs: Vec<(String, JobEntry)>,
    /// `name: reason` for entries that did not parse.
    pub(crate) skipped: Vec<String>,
}

/// Parses the config blob, keeping well-formed entries and reporting the rest.
pub(crate) fn parse_config(yaml: &str) -> anyhow::Result<ParsedConfig> {
    let root: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let mapping = root
        .as_mapping()
        .ok_or_else(|| anyhow::anyhow!("config is not a mapping"))?;

    let mut jobs = Vec::new();
    let mut skipped = Vec::new();
    for (key, value) in mapping {
        let Some(name) = key.as_str() else {
            skipped.push(format!("{key:?}: non-string job name"));
            continue;
        };
        match serde_yaml::from_value::<JobEntry>(value.clone()) {
            Ok(entry) => jobs.push((name.to_string(), entry)),
            Err(err) => skipped.push(format!("{name}: {err}")),
        }
    }

    Ok(ParsedConfig { jobs, skipped })
}

/// Splits a comma-separated tag list, trimming and dropping empties.
pub(crate) fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
