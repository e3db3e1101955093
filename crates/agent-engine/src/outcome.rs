//! The script output protocol.
//!
//! Scripts print a single JSON object to stdout:
//! `{ "tags": "a,b", "content": "<base64 payload>" }`. A run is successful
//! iff the exit code is 0 and `content` is non-empty; everything else is
//! reported under the job's fail tags.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Deserialize;

use crate::config::parse_tags;
use crate::exec::ExecResult;

#[derive(Debug, Default, Deserialize)]
struct ScriptOutput {
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// The digest to publish for one finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResultDigest {
    pub(crate) body: String,
    pub(crate) tags: Vec<String>,
    pub(crate) success: bool,
}

/// Interprets a script run into the digest to publish.
///
/// `processed_id` is set for queue items; it stamps the per-item completion
/// sentinel `processed-{id}` onto the result regardless of success, so the
/// fleet stops re-observing the item either way.
pub(crate) fn interpret(
    result: &ExecResult,
    done_tags: &[String],
    fail_tags: &[String],
    processed_id: Option<&str>,
    job_name: &str,
) -> ResultDigest {
    let output: ScriptOutput = serde_json::from_str(result.stdout.trim()).unwrap_or_default();
    let content_b64 = output.content.unwrap_or_default();
    let success = result.retcode == 0 && !content_b64.is_empty();

    let mut tags: Vec<String> = if success {
        done_tags.to_vec()
    } else {
        fail_tags.to_vec()
    };
    if let Some(id) = processed_id {
        tags.push(format!("processed-{id}"));
    }
    if let Some(extra) = output.tags.as_deref() {
        tags.extend(parse_tags(extra));
    }
    tags.push(job_name.to_string());

    let body = match B64
        .decode(content_b64.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(decoded) => decoded,
        None if !content_b64.is_empty() => "[Invalid base64 result]".to_string(),
        None => result.stdout.clone(),
    };

    ResultDigest { body, tags, success }
}
