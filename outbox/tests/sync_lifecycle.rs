//! End-to-end sync ticks over an in-memory store with scripted workers.

use outbox::core::comment::StructuredComment;
use outbox::core::types::{IssueRef, ResultCode, Role, WorkOrder, WorkState};
use outbox::dispatch::IssueOutcome;
use outbox::io::cache::{KvCache, keys};
use outbox::io::config::{WorkflowProfile, parse_profile};
use outbox::io::context_pack::ContextPack;
use outbox::io::store::{IssueStore, SqliteStore};
use outbox::io::work_result::{
    LoadedResult, ResultFormat, ResultLoader, write_work_result_json,
};
use outbox::issues;
use outbox::sync::{SyncEngine, SyncRequest};
use outbox::test_support::{MemoryCache, ScriptedInvoker, passing_result};

fn profile(max_concurrent: u32) -> WorkflowProfile {
    parse_profile(&format!(
        r#"
version = 2

[roles]
enabled = ["backend", "reviewer"]

[outbox]
backend = "sqlite"

[groups.coders]
role = "backend"
max_concurrent = {max_concurrent}
listen_labels = ["to:backend"]
"#
    ))
    .expect("profile")
}

/// Open issue routed to backend and claimed by its lead.
fn claimed(store: &SqliteStore, body: &str, labels: &[&str]) -> IssueRef {
    let mut all = vec!["to:backend".to_string()];
    all.extend(labels.iter().map(|label| label.to_string()));
    let issue = issues::create(store, "task", body, &all)
        .expect("create")
        .issue_ref;
    issues::claim(store, issue, "lead-backend").expect("claim");
    issue
}

fn comments(store: &SqliteStore, issue: IssueRef) -> Vec<StructuredComment> {
    store
        .read(|tx| tx.events(issue))
        .expect("events")
        .iter()
        .map(|event| StructuredComment::parse(&event.body).expect("structured comment"))
        .collect()
}

fn state(store: &SqliteStore, issue: IssueRef) -> Option<WorkState> {
    store.read(|tx| tx.issue(issue)).expect("issue").state()
}

#[test]
fn needs_human_is_blocked_and_never_spawned() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "", &["needs-human"]);
    let invoker = ScriptedInvoker::new();
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    let report = engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    assert_eq!(report.blocked, 1);
    assert_eq!(report.spawned, 0);
    assert!(invoker.orders().is_empty());
    assert_eq!(state(&store, issue), Some(WorkState::Blocked));
    let written = comments(&store, issue);
    assert_eq!(written[0].blocked_by, vec!["needs-human".to_string()]);
    assert_eq!(written[0].result_code, Some(ResultCode::ManualIntervention));

    let again = engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    assert_eq!(again.skipped, 1);
    assert_eq!(again.spawned, 0);
    assert_eq!(state(&store, issue), Some(WorkState::Blocked));
}

#[test]
fn spawn_cap_defers_the_rest_as_skipped() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(2);
    let packs = tempfile::tempdir().expect("tempdir");
    let first = claimed(&store, "", &[]);
    let second = claimed(&store, "", &[]);
    let third = claimed(&store, "", &[]);
    let invoker = ScriptedInvoker::new().then_pass().then_pass();
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    let report = engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    assert_eq!(report.candidates, 3);
    assert_eq!(report.spawned, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.blocked, 0);
    assert_eq!(state(&store, first), Some(WorkState::Review));
    assert_eq!(state(&store, second), Some(WorkState::Review));
    assert_eq!(state(&store, third), Some(WorkState::Todo));
    assert!(comments(&store, third).is_empty());

    let success = &comments(&store, first)[0];
    assert_eq!(success.action, "complete");
    assert_eq!(success.summary, "ready for review/merge");
    assert_eq!(success.next, "reviewer");
    assert_eq!(success.changes.commit, "git:abc123");
}

#[test]
fn cursor_advances_and_persists() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "", &[]);
    issues::comment(&store, issue, "alice", "please pick this up").expect("comment");
    let invoker = ScriptedInvoker::new().then_pass();
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    let report = engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    assert_eq!(report.cursor_before, 0);
    assert!(report.cursor_after >= 1);
    assert_eq!(
        cache.value(&keys::cursor(Role::Backend)),
        Some(report.cursor_after.to_string())
    );
    let written = comments(&store, issue);
    assert_eq!(written.last().expect("comment").read_up_to, format!("e{}", report.cursor_after));
}

#[test]
fn cursor_write_failure_aborts_the_tick() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "", &["autoflow:off"]);
    issues::comment(&store, issue, "alice", "ping").expect("comment");
    cache.fail_writes_under("lead:backend:cursor");
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(ScriptedInvoker::new());

    let err = engine.sync(&SyncRequest::new(Role::Backend)).unwrap_err();
    assert!(format!("{err:#}").contains("persist sync cursor"));
    assert_eq!(cache.value(&keys::cursor(Role::Backend)), None);
}

#[test]
fn run_token_write_failure_spawns_nothing() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    claimed(&store, "", &[]);
    cache.fail_writes_under("lead:backend:active_run");
    let invoker = ScriptedInvoker::new().then_pass();
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    assert!(engine.sync(&SyncRequest::new(Role::Backend)).is_err());
    assert!(invoker.orders().is_empty());
}

#[test]
fn superseded_run_is_discarded_silently() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "", &[]);
    let invoker = ScriptedInvoker::new().then(|invocation| {
        // A newer run takes over while this one is still in flight.
        cache.set(
            &keys::active_run(Role::Backend, issue),
            "20991231-backend-99",
        )?;
        write_work_result_json(
            &invocation.pack.work_result_json(),
            &passing_result(invocation.order),
        )
    });
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    let report = engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    assert_eq!(report.processed, 1);
    assert_eq!(report.spawned, 1);
    assert_eq!(report.blocked, 0);
    assert!(comments(&store, issue).is_empty());
}

#[test]
fn worker_failure_blocks_with_needs_human_and_tick_continues() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(2);
    let packs = tempfile::tempdir().expect("tempdir");
    let failing = claimed(&store, "", &[]);
    let passing = claimed(&store, "", &[]);
    let invoker = ScriptedInvoker::new()
        .then_fail("worker exited with status 2")
        .then_pass();
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    let report = engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    assert_eq!(report.spawned, 2);
    assert_eq!(report.blocked, 1);

    let current = store.read(|tx| tx.issue(failing)).expect("issue");
    assert_eq!(current.state(), Some(WorkState::Blocked));
    assert!(current.has_label("needs-human"));
    let blocked = &comments(&store, failing)[0];
    assert_eq!(
        blocked.blocked_by,
        vec!["worker-execution".to_string(), "needs-human".to_string()]
    );
    assert!(blocked.summary.contains("worker exited with status 2"));
    assert_eq!(state(&store, passing), Some(WorkState::Review));
}

#[test]
fn missing_result_blocks_as_worker_result() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "", &[]);
    // Exits cleanly without writing any result or log.
    let invoker = ScriptedInvoker::new().then(|_| Ok(()));
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    let outcome = engine.dispatch(Role::Backend, issue, None).expect("dispatch");
    assert!(matches!(outcome, IssueOutcome::Failed { .. }));
    let blocked = &comments(&store, issue)[0];
    assert_eq!(blocked.blocked_by[0], "worker-result");
    assert_eq!(blocked.result_code, Some(ResultCode::OutputUnparseable));
}

#[test]
fn identity_echo_mismatch_is_blocked_with_evidence() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "", &[]);
    let invoker = ScriptedInvoker::new().then_write(|order| {
        let mut result = passing_result(order);
        result.issue_ref = "local#999".to_string();
        result
    });
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    let blocked = &comments(&store, issue)[0];
    assert_eq!(blocked.blocked_by[0], "work-result-echo");
    assert_eq!(blocked.changes.commit, "git:abc123");
    assert_eq!(state(&store, issue), Some(WorkState::Blocked));
}

#[test]
fn unresolved_dependency_blocks_before_spawn() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let dep = issues::create(&store, "dep", "", &[]).expect("create").issue_ref;
    let issue = claimed(&store, &format!("DependsOn: {dep}, github#7"), &[]);
    let invoker = ScriptedInvoker::new();
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    let report = engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    assert_eq!(report.blocked, 1);
    assert!(invoker.orders().is_empty());
    let blocked = &comments(&store, issue)[0];
    assert_eq!(blocked.result_code, Some(ResultCode::DepUnresolved));
    assert_eq!(blocked.blocked_by, vec![dep.to_string()]);
}

#[test]
fn missing_evidence_overrides_worker_code() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "", &[]);
    let invoker = ScriptedInvoker::new().then_write(|order| {
        let mut result = passing_result(order);
        result.changes.commit.clear();
        result.tests.result.clear();
        result.result_code = Some(ResultCode::TestFailed);
        result
    });
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    let blocked = &comments(&store, issue)[0];
    assert_eq!(blocked.result_code, Some(ResultCode::ManualIntervention));
    assert_eq!(state(&store, issue), Some(WorkState::Blocked));
}

#[test]
fn work_order_echoes_run_and_pack_holds_snapshot() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "## Goal\nship it", &[]);
    let invoker = ScriptedInvoker::new().then(|invocation| {
        let snapshot = std::fs::read_to_string(invocation.pack.spec_snapshot())?;
        assert!(snapshot.contains("ship it"));
        write_work_result_json(
            &invocation.pack.work_result_json(),
            &passing_result(invocation.order),
        )
    });
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker);

    engine.sync(&SyncRequest::new(Role::Backend)).expect("sync");
    let orders = invoker.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].issue_ref, issue.to_string());
    assert!(orders[0].run_id.ends_with("-backend-1"));
    assert_eq!(
        cache.value(&keys::active_run(Role::Backend, issue)),
        Some(orders[0].run_id.clone())
    );
}

/// Hands back a passing result without touching the pack.
struct InlineLoader;

impl ResultLoader for InlineLoader {
    fn load(&self, _pack: &ContextPack, order: &WorkOrder) -> anyhow::Result<LoadedResult> {
        Ok(LoadedResult {
            format: ResultFormat::Json,
            result: passing_result(order),
        })
    }
}

#[test]
fn injected_loader_replaces_pack_files() {
    let store = SqliteStore::open_in_memory().expect("store");
    let cache = MemoryCache::new();
    let profile = profile(1);
    let packs = tempfile::tempdir().expect("tempdir");
    let issue = claimed(&store, "", &[]);
    let invoker = ScriptedInvoker::new().then(|_| Ok(()));
    let engine = SyncEngine::new(&store, &cache, &profile, "workflow.toml", packs.path())
        .expect("engine")
        .with_invoker(&invoker)
        .with_loader(InlineLoader);

    let outcome = engine.dispatch(Role::Backend, issue, None).expect("dispatch");
    assert!(matches!(outcome, IssueOutcome::Completed { .. }));
    assert_eq!(state(&store, issue), Some(WorkState::Review));
}
