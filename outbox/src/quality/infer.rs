//! Source-specific inference of quality fields from a raw payload.
//!
//! Inference only proposes values; the caller keeps every field it already
//! has and validates the merged result.

use serde_json::Value;

/// Fields recovered from a payload. `None` means "not derivable".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inferred {
    pub category: Option<String>,
    pub result: Option<String>,
    pub actor: Option<String>,
    pub summary: Option<String>,
    pub evidence: Vec<String>,
    pub external_event_id: Option<String>,
}

/// Infer from `payload` according to `source` (`github`, `gitlab`, anything
/// else is generic). `event_kind` is the provider's event header when known
/// and narrows which sections are consulted.
pub fn infer(source: &str, payload: &Value, event_kind: Option<&str>) -> Inferred {
    match source.trim().to_ascii_lowercase().as_str() {
        "github" => infer_github(payload, event_kind),
        "gitlab" => infer_gitlab(payload, event_kind),
        _ => infer_generic(payload),
    }
}

fn infer_github(payload: &Value, event_kind: Option<&str>) -> Inferred {
    let wants = |kind: &str| event_kind.is_none_or(|hint| hint.eq_ignore_ascii_case(kind));
    let mut inferred = Inferred {
        actor: string_at(payload, &["sender", "login"]),
        ..Inferred::default()
    };

    if wants("pull_request_review")
        && let Some(review) = payload.get("review")
    {
        let state = string_at(review, &["state"]).map(|s| s.to_ascii_lowercase());
        let result = match state.as_deref() {
            Some("approved") => Some("approved"),
            Some("changes_requested") => Some("changes_requested"),
            _ => None,
        };
        if let Some(result) = result {
            inferred.category = Some("review".to_string());
            inferred.result = Some(result.to_string());
            inferred.summary = string_at(review, &["body"]);
            inferred.evidence = string_at(review, &["html_url"]).into_iter().collect();
            inferred.external_event_id = id_at(review);
            if inferred.actor.is_none() {
                inferred.actor = string_at(review, &["user", "login"]);
            }
            return inferred;
        }
    }

    for kind in ["check_run", "check_suite"] {
        if !wants(kind) {
            continue;
        }
        let Some(check) = payload.get(kind) else {
            continue;
        };
        let Some(result) = string_at(check, &["conclusion"]).and_then(|c| ci_result(&c)) else {
            continue;
        };
        let name = string_at(check, &["name"])
            .or_else(|| string_at(check, &["app", "name"]))
            .unwrap_or_else(|| kind.to_string());
        inferred.category = Some("ci".to_string());
        inferred.result = Some(result.to_string());
        inferred.summary = Some(format!("{name} {result}"));
        inferred.evidence = string_at(check, &["html_url"])
            .or_else(|| string_at(check, &["details_url"]))
            .or_else(|| string_at(check, &["url"]))
            .into_iter()
            .collect();
        inferred.external_event_id = id_at(check);
        return inferred;
    }
    inferred
}

fn infer_gitlab(payload: &Value, event_kind: Option<&str>) -> Inferred {
    let object_kind = string_at(payload, &["object_kind"]).unwrap_or_default();
    let attrs = payload.get("object_attributes");
    let mut inferred = Inferred {
        actor: string_at(payload, &["user", "username"]),
        ..Inferred::default()
    };
    let pipeline_hint = event_kind.is_none_or(|hint| hint.to_ascii_lowercase().contains("pipeline"));

    if object_kind == "merge_request"
        && let Some(attrs) = attrs
        && string_at(attrs, &["action"]).as_deref() == Some("approved")
    {
        inferred.category = Some("review".to_string());
        inferred.result = Some("approved".to_string());
        inferred.summary = string_at(attrs, &["title"]).map(|title| format!("approved: {title}"));
        inferred.evidence = string_at(attrs, &["url"]).into_iter().collect();
        inferred.external_event_id = id_at(attrs);
        return inferred;
    }

    let status = if object_kind == "pipeline" {
        attrs.and_then(|attrs| string_at(attrs, &["status"]))
    } else if pipeline_hint {
        string_at(payload, &["pipeline", "status"])
    } else {
        None
    };
    if let Some(result) = status.as_deref().and_then(pipeline_result) {
        let source = if object_kind == "pipeline" {
            attrs
        } else {
            payload.get("pipeline")
        };
        inferred.category = Some("ci".to_string());
        inferred.result = Some(result.to_string());
        inferred.summary = Some(format!("pipeline {}", status.unwrap_or_default()));
        inferred.evidence = source
            .and_then(|s| string_at(s, &["url"]).or_else(|| string_at(s, &["web_url"])))
            .into_iter()
            .collect();
        inferred.external_event_id = source.and_then(id_at);
    }
    inferred
}

fn infer_generic(payload: &Value) -> Inferred {
    let evidence = match payload.get("evidence") {
        Some(Value::String(item)) if !item.trim().is_empty() => vec![item.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    Inferred {
        category: string_at(payload, &["category"]),
        result: string_at(payload, &["result"]),
        actor: string_at(payload, &["actor"]),
        summary: string_at(payload, &["summary"]),
        evidence,
        external_event_id: string_at(payload, &["event_id"]),
    }
}

/// GitHub check conclusion to pass/fail.
fn ci_result(conclusion: &str) -> Option<&'static str> {
    match conclusion.to_ascii_lowercase().as_str() {
        "success" | "neutral" | "skipped" => Some("pass"),
        "" => None,
        _ => Some("fail"),
    }
}

/// GitLab pipeline status to pass/fail; running states are not signals.
fn pipeline_result(status: &str) -> Option<&'static str> {
    match status.to_ascii_lowercase().as_str() {
        "success" => Some("pass"),
        "failed" | "canceled" => Some("fail"),
        _ => None,
    }
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    let text = current.as_str()?.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn id_at(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}
