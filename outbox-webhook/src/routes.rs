//! HTTP route handlers for provider webhooks.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use outbox::core::types::{IssueRef, Role};
use outbox::quality::{self, IngestOutcome, IngestRequest};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::error::WebhookError;
use crate::signature::{AuthError, verify_github, verify_gitlab};
use crate::state::AppState;

const GITHUB: &str = "github";
const GITLAB: &str = "gitlab";

/// Build the webhook router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/github", post(github))
        .route("/webhooks/gitlab", post(gitlab))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    pub issue_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookResponse {
    pub issue_ref: String,
    pub duplicate: bool,
    pub marker: String,
    pub routed_role: Option<Role>,
}

impl From<IngestOutcome> for WebhookResponse {
    fn from(outcome: IngestOutcome) -> Self {
        Self {
            issue_ref: outcome.issue_ref,
            duplicate: outcome.duplicate,
            marker: outcome.marker,
            routed_role: outcome.routed_role,
        }
    }
}

/// POST /webhooks/github
#[instrument(skip_all, fields(source = GITHUB))]
pub async fn github(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookError> {
    let issue = issue_ref(&query)?;
    let delivery = header(&headers, "x-github-delivery");
    if let Some(secret) = state.secrets.github.as_deref() {
        let signature = header(&headers, "x-hub-signature-256");
        if let Err(err) = verify_github(secret, signature.as_deref(), &body) {
            return Err(reject(&state, issue, GITHUB, err, delivery).await);
        }
    }
    let request = ingest_request(issue, GITHUB, &body, delivery, header(&headers, "x-github-event"))?;
    ingest(&state, request).await
}

/// POST /webhooks/gitlab
#[instrument(skip_all, fields(source = GITLAB))]
pub async fn gitlab(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookError> {
    let issue = issue_ref(&query)?;
    let delivery = header(&headers, "x-gitlab-event-uuid");
    if let Some(token) = state.secrets.gitlab.as_deref() {
        let presented = header(&headers, "x-gitlab-token");
        if let Err(err) = verify_gitlab(token, presented.as_deref()) {
            return Err(reject(&state, issue, GITLAB, err, delivery).await);
        }
    }
    let request = ingest_request(issue, GITLAB, &body, delivery, header(&headers, "x-gitlab-event"))?;
    ingest(&state, request).await
}

fn issue_ref(query: &WebhookQuery) -> Result<IssueRef, WebhookError> {
    let raw = query
        .issue_ref
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| WebhookError::BadRequest("issue_ref query parameter is required".to_string()))?;
    raw.parse()
        .map_err(|err| WebhookError::BadRequest(format!("invalid issue_ref: {err}")))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn ingest_request(
    issue: IssueRef,
    source: &str,
    body: &[u8],
    delivery: Option<String>,
    event_kind: Option<String>,
) -> Result<IngestRequest, WebhookError> {
    let payload = std::str::from_utf8(body)
        .map_err(|_| WebhookError::BadRequest("payload is not valid UTF-8".to_string()))?;
    Ok(IngestRequest {
        issue_ref: issue,
        source: source.to_string(),
        payload: Some(payload.to_string()),
        event_key: delivery.clone(),
        external_event_id: delivery,
        event_kind,
        ..IngestRequest::default()
    })
}

async fn ingest(
    state: &AppState,
    request: IngestRequest,
) -> Result<Json<WebhookResponse>, WebhookError> {
    let store = state.store.clone();
    let outcome = tokio::task::spawn_blocking(move || quality::ingest(store.as_ref(), &request))
        .await
        .map_err(|err| WebhookError::Internal(format!("ingest task failed: {err}")))??;
    info!(
        issue = %outcome.issue_ref,
        marker = %outcome.marker,
        duplicate = outcome.duplicate,
        "webhook ingested"
    );
    Ok(Json(outcome.into()))
}

/// Record the rejected delivery for audit, then answer 401.
async fn reject(
    state: &AppState,
    issue: IssueRef,
    source: &'static str,
    err: AuthError,
    delivery: Option<String>,
) -> WebhookError {
    let reason = err.to_string();
    warn!(%issue, source, %reason, "webhook authentication failed");
    let store = state.store.clone();
    let summary = reason.clone();
    let audit = tokio::task::spawn_blocking(move || {
        quality::record_auth_rejection(store.as_ref(), issue, source, &summary, delivery.as_deref())
    })
    .await;
    match audit {
        Ok(Ok(_)) => {}
        Ok(Err(audit_err)) => warn!(err = %format!("{audit_err:#}"), "auth rejection audit failed"),
        Err(join_err) => warn!(err = %join_err, "auth rejection audit task failed"),
    }
    WebhookError::Unauthorized(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::sign_github;
    use crate::state::Secrets;
    use axum::http::HeaderValue;
    use outbox::io::store::{IssueStore, SqliteStore};
    use outbox::issues;

    fn app(secrets: Secrets) -> (AppState, IssueRef) {
        let store = SqliteStore::open_in_memory().expect("store");
        let issue = issues::create(&store, "hooked", "", &["role:backend".to_string()])
            .expect("create")
            .issue_ref;
        (AppState::new(store, secrets), issue)
    }

    fn query(issue: IssueRef) -> Query<WebhookQuery> {
        Query(WebhookQuery {
            issue_ref: Some(issue.to_string()),
        })
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).expect("header"));
        }
        map
    }

    const REVIEW: &str = r#"{
        "review": {"state": "approved", "body": "lgtm", "id": 991, "user": {"login": "octocat"}},
        "sender": {"login": "octocat"}
    }"#;

    #[tokio::test]
    async fn signed_github_review_is_ingested_once() {
        let (state, issue) = app(Secrets {
            github: Some("s3cret".to_string()),
            gitlab: None,
        });
        let signature = sign_github("s3cret", REVIEW.as_bytes());
        let request_headers = headers(&[
            ("x-hub-signature-256", signature.as_str()),
            ("x-github-delivery", "d-1"),
            ("x-github-event", "pull_request_review"),
        ]);

        let Json(first) = github(
            State(state.clone()),
            query(issue),
            request_headers.clone(),
            Bytes::from_static(REVIEW.as_bytes()),
        )
        .await
        .expect("ingest");
        assert_eq!(first.marker, "review:approved");
        assert_eq!(first.routed_role, Some(Role::Integrator));
        assert!(!first.duplicate);

        let Json(again) = github(
            State(state.clone()),
            query(issue),
            request_headers,
            Bytes::from_static(REVIEW.as_bytes()),
        )
        .await
        .expect("replay");
        assert!(again.duplicate);

        let current = state.store.read(|tx| tx.issue(issue)).expect("issue");
        assert!(current.has_label("review:approved"));
    }

    #[tokio::test]
    async fn bad_github_signature_is_audited_and_unauthorized() {
        let (state, issue) = app(Secrets {
            github: Some("s3cret".to_string()),
            gitlab: None,
        });
        let err = github(
            State(state.clone()),
            query(issue),
            headers(&[
                ("x-hub-signature-256", "sha256=00"),
                ("x-github-delivery", "d-2"),
            ]),
            Bytes::from_static(REVIEW.as_bytes()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WebhookError::Unauthorized(_)));

        let audit = state
            .store
            .read(|tx| tx.quality_events(issue))
            .expect("quality");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event.category, "webhook");
        assert_eq!(audit[0].event.result, "auth_rejected");
        assert_eq!(audit[0].event.summary, "signature does not match payload");
        assert_eq!(audit[0].event.external_event_id, "d-2");
        let current = state.store.read(|tx| tx.issue(issue)).expect("issue");
        assert!(!current.has_label("review:approved"));
    }

    #[tokio::test]
    async fn gitlab_pipeline_failure_routes_back_to_coder() {
        let (state, issue) = app(Secrets {
            github: None,
            gitlab: Some("tok".to_string()),
        });
        let payload = r#"{
            "object_kind": "pipeline",
            "object_attributes": {"id": 77, "status": "failed", "url": "https://gitlab.example.test/p/77"},
            "user": {"username": "ci-bot"}
        }"#;
        let Json(response) = gitlab(
            State(state.clone()),
            query(issue),
            headers(&[
                ("x-gitlab-token", "tok"),
                ("x-gitlab-event", "Pipeline Hook"),
                ("x-gitlab-event-uuid", "u-1"),
            ]),
            Bytes::from(payload.to_string()),
        )
        .await
        .expect("ingest");
        assert_eq!(response.marker, "qa:fail");
        assert_eq!(response.routed_role, Some(Role::Backend));
    }

    #[tokio::test]
    async fn gitlab_wrong_token_is_unauthorized() {
        let (state, issue) = app(Secrets {
            github: None,
            gitlab: Some("tok".to_string()),
        });
        let err = gitlab(
            State(state.clone()),
            query(issue),
            headers(&[("x-gitlab-token", "nope")]),
            Bytes::from_static(b"{}"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "X-Gitlab-Token does not match");
        let audit = state
            .store
            .read(|tx| tx.quality_events(issue))
            .expect("quality");
        assert_eq!(audit[0].event.actor, "webhook-gitlab");
    }

    #[tokio::test]
    async fn missing_issue_ref_is_bad_request() {
        let (state, _) = app(Secrets::default());
        let err = github(
            State(state),
            Query(WebhookQuery::default()),
            HeaderMap::new(),
            Bytes::from_static(REVIEW.as_bytes()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WebhookError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unrecognized_payload_is_bad_request() {
        let (state, issue) = app(Secrets::default());
        let err = github(
            State(state),
            query(issue),
            headers(&[("x-github-event", "push")]),
            Bytes::from_static(br#"{"ref":"refs/heads/main"}"#),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WebhookError::BadRequest(_)));
    }
}
