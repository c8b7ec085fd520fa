//! Quality event ingestion: review and CI signals from the CLI, raw payloads
//! and webhooks become one idempotent audit record plus a label writeback.
//!
//! The whole ingest is one store transaction. A replayed signal (same
//! idempotency key) is detected by the insert and produces no writeback.

pub mod infer;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::core::comment::StructuredComment;
use crate::core::labels::{
    QA_FAIL, QA_PASS, REVIEW_APPROVED, REVIEW_CHANGES_REQUESTED, next_role_for_review_changes,
    route_label,
};
use crate::core::types::{IssueRef, ResultCode, Role, TestReport, WorkState};
use crate::error::invalid;
use crate::io::store::{IssueStore, IssueTx, NewQualityEvent};

/// Marker recorded for rejected webhook deliveries. Never applied as a label.
pub const WEBHOOK_AUTH_REJECTED: &str = "webhook:auth_rejected";

/// Raw ingest input. Missing fields may be inferred from `payload`.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub issue_ref: IssueRef,
    pub source: String,
    pub category: Option<String>,
    pub result: Option<String>,
    pub actor: Option<String>,
    pub summary: Option<String>,
    pub evidence: Vec<String>,
    /// Raw JSON payload as received.
    pub payload: Option<String>,
    /// Explicit idempotency key (e.g. a webhook delivery id).
    pub event_key: Option<String>,
    pub external_event_id: Option<String>,
    /// Provider event header, used as an inference hint.
    pub event_kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub issue_ref: String,
    pub duplicate: bool,
    pub marker: String,
    pub routed_role: Option<Role>,
    pub comment_written: bool,
    pub idempotency_key: String,
}

/// Closed set of accepted category/result pairs. `AuthRejected` is never
/// parsed; only [`record_auth_rejection`] produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ReviewApproved,
    ReviewChangesRequested,
    CiPass,
    CiFail,
    AuthRejected,
}

impl Signal {
    pub fn parse(category: &str, result: &str) -> Result<Self> {
        let category = category.trim().to_ascii_lowercase();
        let result = result.trim().to_ascii_lowercase();
        match (category.as_str(), result.as_str()) {
            ("review", "approved") => Ok(Signal::ReviewApproved),
            ("review", "changes_requested") => Ok(Signal::ReviewChangesRequested),
            ("ci", "pass") => Ok(Signal::CiPass),
            ("ci", "fail") => Ok(Signal::CiFail),
            ("review", other) => Err(invalid!(
                "review result must be approved or changes_requested, got '{other}'"
            )),
            ("ci", other) => Err(invalid!("ci result must be pass or fail, got '{other}'")),
            (other, _) => Err(invalid!("category must be review or ci, got '{other}'")),
        }
    }

    pub fn category(self) -> &'static str {
        match self {
            Signal::ReviewApproved | Signal::ReviewChangesRequested => "review",
            Signal::CiPass | Signal::CiFail => "ci",
            Signal::AuthRejected => "webhook",
        }
    }

    pub fn result(self) -> &'static str {
        match self {
            Signal::ReviewApproved => "approved",
            Signal::ReviewChangesRequested => "changes_requested",
            Signal::CiPass => "pass",
            Signal::CiFail => "fail",
            Signal::AuthRejected => "auth_rejected",
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            Signal::ReviewApproved => REVIEW_APPROVED,
            Signal::ReviewChangesRequested => REVIEW_CHANGES_REQUESTED,
            Signal::CiPass => QA_PASS,
            Signal::CiFail => QA_FAIL,
            Signal::AuthRejected => WEBHOOK_AUTH_REJECTED,
        }
    }

    /// Marker label this signal supersedes.
    fn opposite(self) -> Option<&'static str> {
        match self {
            Signal::ReviewApproved => Some(REVIEW_CHANGES_REQUESTED),
            Signal::ReviewChangesRequested => Some(REVIEW_APPROVED),
            Signal::CiPass => Some(QA_FAIL),
            Signal::CiFail => Some(QA_PASS),
            Signal::AuthRejected => None,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Signal::ReviewChangesRequested | Signal::CiFail)
    }

    fn result_code(self) -> Option<ResultCode> {
        match self {
            Signal::ReviewChangesRequested => Some(ResultCode::ReviewChangesRequested),
            Signal::CiFail => Some(ResultCode::CiFailed),
            Signal::AuthRejected => Some(ResultCode::PermissionDenied),
            Signal::ReviewApproved | Signal::CiPass => None,
        }
    }
}

/// Fully resolved event, ready for insert.
#[derive(Debug, Clone)]
struct Resolved {
    signal: Signal,
    event: NewQualityEvent,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn resolve(request: &IngestRequest) -> Result<Resolved> {
    let source = request.source.trim().to_ascii_lowercase();
    if source.is_empty() {
        return Err(invalid!("source is required"));
    }
    let mut category = non_empty(request.category.as_deref());
    let mut result = non_empty(request.result.as_deref());
    let mut actor = non_empty(request.actor.as_deref());
    let mut summary = non_empty(request.summary.as_deref());
    let mut evidence: Vec<String> = request
        .evidence
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    let mut external_event_id = non_empty(request.external_event_id.as_deref());
    let payload = request.payload.as_deref().map(str::trim).unwrap_or("");

    let incomplete = category.is_none()
        || result.is_none()
        || actor.is_none()
        || summary.is_none()
        || evidence.is_empty()
        || external_event_id.is_none();
    if incomplete && !payload.is_empty() {
        let value: Value = serde_json::from_str(payload)
            .map_err(|err| invalid!("payload is not valid JSON: {err}"))?;
        let inferred = infer::infer(&source, &value, request.event_kind.as_deref());
        debug!(?inferred, "inferred quality fields from payload");
        category = category.or(inferred.category);
        result = result.or(inferred.result);
        actor = actor.or(inferred.actor);
        summary = summary.or(inferred.summary);
        external_event_id = external_event_id.or(inferred.external_event_id);
        if evidence.is_empty() {
            evidence = inferred.evidence;
        }
    }

    let category = category.ok_or_else(|| invalid!("category is required"))?;
    let result = result.ok_or_else(|| invalid!("result is required"))?;
    let signal = Signal::parse(&category, &result)?;
    let actor = actor.ok_or_else(|| invalid!("actor is required"))?;
    if signal.is_failure() && evidence.is_empty() {
        return Err(invalid!(
            "{} {} requires evidence",
            signal.category(),
            signal.result()
        ));
    }
    let summary = summary
        .unwrap_or_else(|| format!("{} {} via {source}", signal.category(), signal.result()));

    let event = NewQualityEvent {
        issue_ref: request.issue_ref,
        idempotency_key: String::new(),
        source,
        external_event_id: external_event_id.unwrap_or_default(),
        category: signal.category().to_string(),
        result: signal.result().to_string(),
        actor,
        summary,
        evidence,
        payload: payload.to_string(),
    };
    Ok(Resolved::keyed(signal, event, request.event_key.as_deref()))
}

impl Resolved {
    /// Attach the explicit key, or the content hash when none is given.
    fn keyed(signal: Signal, mut event: NewQualityEvent, event_key: Option<&str>) -> Self {
        event.idempotency_key = match non_empty(event_key) {
            Some(key) => key,
            None => idempotency_key(&event),
        };
        Resolved { signal, event }
    }
}

/// Content hash over every identifying field of the event.
pub fn idempotency_key(event: &NewQualityEvent) -> String {
    let evidence = event.evidence.join(",");
    let issue_ref = event.issue_ref.to_string();
    let fields = [
        issue_ref.as_str(),
        event.source.as_str(),
        event.external_event_id.as_str(),
        event.category.as_str(),
        event.result.as_str(),
        event.actor.as_str(),
        event.summary.as_str(),
        evidence.as_str(),
        event.payload.as_str(),
    ];
    let mut hasher = Sha256::new();
    hasher.update(fields.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// Ingest one signal inside a single transaction.
#[instrument(skip_all, fields(issue = %request.issue_ref, source = %request.source))]
pub fn ingest<S: IssueStore>(store: &S, request: &IngestRequest) -> Result<IngestOutcome> {
    let resolved = resolve(request)?;
    commit(store, &resolved)
}

fn commit<S: IssueStore>(store: &S, resolved: &Resolved) -> Result<IngestOutcome> {
    let outcome = store.transaction(|tx| ingest_in(tx, resolved))?;
    if outcome.duplicate {
        debug!(key = %outcome.idempotency_key, "duplicate quality event ignored");
    } else {
        info!(marker = %outcome.marker, routed = ?outcome.routed_role, "quality event ingested");
    }
    Ok(outcome)
}

fn ingest_in(tx: &dyn IssueTx, resolved: &Resolved) -> Result<IngestOutcome> {
    let Resolved { signal, event } = resolved;
    let issue = tx.issue(event.issue_ref)?;
    let mut outcome = IngestOutcome {
        issue_ref: event.issue_ref.to_string(),
        duplicate: false,
        marker: signal.marker().to_string(),
        routed_role: None,
        comment_written: false,
        idempotency_key: event.idempotency_key.clone(),
    };
    if !tx
        .insert_quality_event(event)
        .context("insert quality event")?
    {
        outcome.duplicate = true;
        return Ok(outcome);
    }

    let mut state = issue.state();
    if *signal != Signal::AuthRejected {
        let routed = if signal.is_failure() {
            next_role_for_review_changes(&issue.labels)
        } else {
            Role::Integrator
        };
        tx.add_label(issue.issue_ref, signal.marker())?;
        if let Some(opposite) = signal.opposite() {
            tx.remove_label(issue.issue_ref, opposite)?;
        }
        tx.add_label(issue.issue_ref, &route_label(routed))?;
        if signal.is_failure() {
            // Coding-role tags stay: failure routing is derived from them.
            tx.remove_label(issue.issue_ref, &route_label(Role::Integrator))?;
            tx.set_state(issue.issue_ref, WorkState::Blocked)?;
            state = Some(WorkState::Blocked);
        }
        outcome.routed_role = Some(routed);
    }

    let comment = StructuredComment {
        role: event.actor.clone(),
        issue_ref: event.issue_ref.to_string(),
        action: "quality".to_string(),
        status: state.map(|state| state.to_string()).unwrap_or_default(),
        result_code: signal.result_code(),
        trigger: format!("quality:{}", event.source),
        summary: format!("[{}] {}", signal.marker(), event.summary),
        tests: TestReport {
            command: event.category.clone(),
            result: event.result.clone(),
            evidence: event.evidence.join(", "),
        },
        next: outcome
            .routed_role
            .map(|role| role.to_string())
            .unwrap_or_else(|| "human".to_string()),
        ..StructuredComment::default()
    };
    tx.append_event(issue.issue_ref, &event.actor, &comment.render())?;
    outcome.comment_written = true;
    Ok(outcome)
}

/// Record a rejected webhook delivery. The summary is the validation error.
#[instrument(skip_all, fields(issue = %issue_ref, source = %source))]
pub fn record_auth_rejection<S: IssueStore>(
    store: &S,
    issue_ref: IssueRef,
    source: &str,
    reason: &str,
    delivery_id: Option<&str>,
) -> Result<IngestOutcome> {
    let source = source.trim().to_ascii_lowercase();
    if source.is_empty() {
        return Err(invalid!("source is required"));
    }
    let signal = Signal::AuthRejected;
    let event = NewQualityEvent {
        issue_ref,
        idempotency_key: String::new(),
        actor: format!("webhook-{source}"),
        external_event_id: delivery_id.map(str::trim).unwrap_or_default().to_string(),
        source,
        category: signal.category().to_string(),
        result: signal.result().to_string(),
        summary: reason.trim().to_string(),
        evidence: Vec::new(),
        payload: String::new(),
    };
    commit(store, &Resolved::keyed(signal, event, None))
}
