//! Issue store: issues, labels, the append-only event timeline and quality
//! events, behind a transaction-scoped handle.
//!
//! Every logical operation runs inside `store.transaction(|tx| ..)`; the handle
//! is passed explicitly, commits when the closure returns `Ok` and rolls back
//! otherwise.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, instrument};

use crate::core::types::{Event, Issue, IssueRef, LabelSet, WorkState};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS issues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    assignee TEXT,
    closed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    closed_at TEXT
);
CREATE TABLE IF NOT EXISTS labels (
    issue_id INTEGER NOT NULL REFERENCES issues(id),
    label TEXT NOT NULL,
    PRIMARY KEY (issue_id, label)
);
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id INTEGER NOT NULL REFERENCES issues(id),
    actor TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_issue ON events(issue_id, id);
CREATE TABLE IF NOT EXISTS quality_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id INTEGER NOT NULL REFERENCES issues(id),
    idempotency_key TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    external_event_id TEXT NOT NULL,
    category TEXT NOT NULL,
    result TEXT NOT NULL,
    actor TEXT NOT NULL,
    summary TEXT NOT NULL,
    evidence TEXT NOT NULL,
    payload TEXT NOT NULL,
    ingested_at TEXT NOT NULL
);
"#;

/// Quality event about to be inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewQualityEvent {
    pub issue_ref: IssueRef,
    pub idempotency_key: String,
    pub source: String,
    pub external_event_id: String,
    pub category: String,
    pub result: String,
    pub actor: String,
    pub summary: String,
    pub evidence: Vec<String>,
    pub payload: String,
}

/// Stored, immutable quality event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityEvent {
    pub id: i64,
    pub event: NewQualityEvent,
    pub ingested_at: String,
}

/// Operations available inside one transaction.
pub trait IssueTx {
    fn find_issue(&self, issue: IssueRef) -> Result<Option<Issue>>;
    fn create_issue(&self, title: &str, body: &str, labels: &LabelSet) -> Result<Issue>;
    fn set_assignee(&self, issue: IssueRef, assignee: Option<&str>) -> Result<()>;
    fn add_label(&self, issue: IssueRef, label: &str) -> Result<()>;
    fn remove_label(&self, issue: IssueRef, label: &str) -> Result<()>;
    fn append_event(&self, issue: IssueRef, actor: &str, body: &str) -> Result<Event>;
    fn events(&self, issue: IssueRef) -> Result<Vec<Event>>;
    /// Events with `id > cursor`, oldest first, at most `limit`.
    fn events_after(&self, cursor: i64, limit: usize) -> Result<Vec<Event>>;
    /// Open issues carrying at least one of `labels`, ascending.
    fn open_issues_with_any_label(&self, labels: &[String]) -> Result<Vec<IssueRef>>;
    fn open_issues_assigned_to(&self, actor: &str) -> Result<Vec<IssueRef>>;
    fn close_issue(&self, issue: IssueRef) -> Result<()>;
    /// Insert-or-ignore on the idempotency key. `false` means duplicate.
    fn insert_quality_event(&self, event: &NewQualityEvent) -> Result<bool>;
    fn quality_events(&self, issue: IssueRef) -> Result<Vec<QualityEvent>>;

    fn issue(&self, issue: IssueRef) -> Result<Issue> {
        self.find_issue(issue)?
            .ok_or_else(|| anyhow!("issue {issue} not found"))
    }

    /// Replace the singleton `state:*` label.
    fn set_state(&self, issue: IssueRef, state: WorkState) -> Result<()> {
        let target = state.label();
        let current = self.issue(issue)?;
        for label in current
            .labels
            .iter()
            .filter(|label| label.starts_with(WorkState::LABEL_PREFIX) && **label != target)
        {
            self.remove_label(issue, label)?;
        }
        self.add_label(issue, &target)
    }
}

/// Transactional store.
pub trait IssueStore {
    fn transaction<T>(&self, f: impl FnOnce(&dyn IssueTx) -> Result<T>) -> Result<T>;

    /// Run read-only queries against a consistent snapshot.
    fn read<T>(&self, f: impl FnOnce(&dyn IssueTx) -> Result<T>) -> Result<T>;
}

/// SQLite-backed [`IssueStore`].
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open store {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("apply store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl IssueStore for SqliteStore {
    fn transaction<T>(&self, f: impl FnOnce(&dyn IssueTx) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("issue store lock poisoned"))?;
        let tx = conn.transaction().context("begin transaction")?;
        let value = f(&SqliteTx { conn: &tx })?;
        tx.commit().context("commit transaction")?;
        Ok(value)
    }

    fn read<T>(&self, f: impl FnOnce(&dyn IssueTx) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("issue store lock poisoned"))?;
        f(&SqliteTx { conn: &conn })
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl SqliteTx<'_> {
    fn ensure_open(&self, issue: IssueRef) -> Result<()> {
        let closed: Option<bool> = self
            .conn
            .query_row(
                "SELECT closed FROM issues WHERE id = ?1",
                params![issue.id()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("load issue {issue}"))?;
        match closed {
            None => bail!("issue {issue} not found"),
            Some(true) => bail!("issue {issue} is closed"),
            Some(false) => Ok(()),
        }
    }

    fn touch(&self, issue: IssueRef) -> Result<()> {
        self.conn
            .execute(
                "UPDATE issues SET updated_at = ?1 WHERE id = ?2",
                params![now(), issue.id()],
            )
            .with_context(|| format!("touch issue {issue}"))?;
        Ok(())
    }

    fn labels(&self, issue: IssueRef) -> Result<LabelSet> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM labels WHERE issue_id = ?1")?;
        let rows = stmt.query_map(params![issue.id()], |row| row.get::<_, String>(0))?;
        let mut labels = LabelSet::new();
        for label in rows {
            labels.insert(label?);
        }
        Ok(labels)
    }

    fn issue_ids(&self, sql: &str, args: &[String]) -> Result<Vec<IssueRef>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(IssueRef(id?));
        }
        Ok(ids)
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        issue_ref: IssueRef(row.get(1)?),
        actor: row.get(2)?,
        body: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl IssueTx for SqliteTx<'_> {
    fn find_issue(&self, issue: IssueRef) -> Result<Option<Issue>> {
        let found = self
            .conn
            .query_row(
                "SELECT title, body, assignee, closed, created_at, updated_at, closed_at
                 FROM issues WHERE id = ?1",
                params![issue.id()],
                |row| {
                    Ok(Issue {
                        issue_ref: issue,
                        title: row.get(0)?,
                        body: row.get(1)?,
                        assignee: row.get(2)?,
                        closed: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                        closed_at: row.get(6)?,
                        labels: LabelSet::new(),
                    })
                },
            )
            .optional()
            .with_context(|| format!("load issue {issue}"))?;
        let Some(mut found) = found else {
            return Ok(None);
        };
        found.labels = self.labels(issue)?;
        Ok(Some(found))
    }

    #[instrument(skip_all, fields(title))]
    fn create_issue(&self, title: &str, body: &str, labels: &LabelSet) -> Result<Issue> {
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO issues (title, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![title, body, ts],
            )
            .context("insert issue")?;
        let issue = IssueRef(self.conn.last_insert_rowid());
        for label in labels {
            self.add_label(issue, label)?;
        }
        debug!(%issue, "issue created");
        self.issue(issue)
    }

    fn set_assignee(&self, issue: IssueRef, assignee: Option<&str>) -> Result<()> {
        self.ensure_open(issue)?;
        self.conn
            .execute(
                "UPDATE issues SET assignee = ?1, updated_at = ?2 WHERE id = ?3",
                params![assignee, now(), issue.id()],
            )
            .with_context(|| format!("assign issue {issue}"))?;
        Ok(())
    }

    fn add_label(&self, issue: IssueRef, label: &str) -> Result<()> {
        self.ensure_open(issue)?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
                params![issue.id(), label],
            )
            .with_context(|| format!("add label '{label}' to {issue}"))?;
        if inserted > 0 {
            self.touch(issue)?;
        }
        Ok(())
    }

    fn remove_label(&self, issue: IssueRef, label: &str) -> Result<()> {
        self.ensure_open(issue)?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM labels WHERE issue_id = ?1 AND label = ?2",
                params![issue.id(), label],
            )
            .with_context(|| format!("remove label '{label}' from {issue}"))?;
        if removed > 0 {
            self.touch(issue)?;
        }
        Ok(())
    }

    fn append_event(&self, issue: IssueRef, actor: &str, body: &str) -> Result<Event> {
        self.ensure_open(issue)?;
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO events (issue_id, actor, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![issue.id(), actor, body, ts],
            )
            .with_context(|| format!("append event to {issue}"))?;
        let id = self.conn.last_insert_rowid();
        self.touch(issue)?;
        debug!(%issue, event_id = id, actor, "event appended");
        Ok(Event {
            id,
            issue_ref: issue,
            actor: actor.to_string(),
            body: body.to_string(),
            created_at: ts,
        })
    }

    fn events(&self, issue: IssueRef) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_id, actor, body, created_at FROM events
             WHERE issue_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![issue.id()], event_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("list events for {issue}"))
    }

    fn events_after(&self, cursor: i64, limit: usize) -> Result<Vec<Event>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_id, actor, body, created_at FROM events
             WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cursor, limit], event_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("list events after e{cursor}"))
    }

    fn open_issues_with_any_label(&self, labels: &[String]) -> Result<Vec<IssueRef>> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; labels.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT i.id FROM issues i JOIN labels l ON l.issue_id = i.id
             WHERE i.closed = 0 AND l.label IN ({placeholders}) ORDER BY i.id"
        );
        self.issue_ids(&sql, labels)
            .context("list open issues by label")
    }

    fn open_issues_assigned_to(&self, actor: &str) -> Result<Vec<IssueRef>> {
        self.issue_ids(
            "SELECT id FROM issues WHERE closed = 0 AND assignee = ?1 ORDER BY id",
            &[actor.to_string()],
        )
        .context("list assigned issues")
    }

    fn close_issue(&self, issue: IssueRef) -> Result<()> {
        self.ensure_open(issue)?;
        let ts = now();
        self.conn
            .execute(
                "UPDATE issues SET closed = 1, closed_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![ts, issue.id()],
            )
            .with_context(|| format!("close issue {issue}"))?;
        Ok(())
    }

    fn insert_quality_event(&self, event: &NewQualityEvent) -> Result<bool> {
        self.ensure_open(event.issue_ref)?;
        let evidence = serde_json::to_string(&event.evidence)?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO quality_events (
                    issue_id, idempotency_key, source, external_event_id, category,
                    result, actor, summary, evidence, payload, ingested_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    event.issue_ref.id(),
                    event.idempotency_key,
                    event.source,
                    event.external_event_id,
                    event.category,
                    event.result,
                    event.actor,
                    event.summary,
                    evidence,
                    event.payload,
                    now(),
                ],
            )
            .context("insert quality event")?;
        Ok(inserted > 0)
    }

    fn quality_events(&self, issue: IssueRef) -> Result<Vec<QualityEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, idempotency_key, source, external_event_id, category, result,
                    actor, summary, evidence, payload, ingested_at
             FROM quality_events WHERE issue_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![issue.id()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                NewQualityEvent {
                    issue_ref: issue,
                    idempotency_key: row.get(1)?,
                    source: row.get(2)?,
                    external_event_id: row.get(3)?,
                    category: row.get(4)?,
                    result: row.get(5)?,
                    actor: row.get(6)?,
                    summary: row.get(7)?,
                    evidence: Vec::new(),
                    payload: row.get(9)?,
                },
                row.get::<_, String>(8)?,
                row.get::<_, String>(10)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (id, mut event, evidence, ingested_at) = row?;
            event.evidence = serde_json::from_str(&evidence)
                .with_context(|| format!("parse evidence of quality event {id}"))?;
            events.push(QualityEvent {
                id,
                event,
                ingested_at,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> LabelSet {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn rolled_back_transaction_leaves_nothing_behind() {
        let store = SqliteStore::open_in_memory().expect("store");
        let result: Result<()> = store.transaction(|tx| {
            tx.create_issue("t", "b", &labels(&["state:todo"]))?;
            bail!("abort")
        });
        assert!(result.is_err());
        let found = store.read(|tx| tx.find_issue(IssueRef(1))).expect("read");
        assert!(found.is_none());
    }

    #[test]
    fn set_state_keeps_a_single_state_label() {
        let store = SqliteStore::open_in_memory().expect("store");
        let issue = store
            .transaction(|tx| {
                let issue = tx.create_issue("t", "b", &labels(&["state:todo", "to:backend"]))?;
                tx.set_state(issue.issue_ref, WorkState::Blocked)?;
                tx.issue(issue.issue_ref)
            })
            .expect("tx");
        assert_eq!(issue.labels, labels(&["state:blocked", "to:backend"]));
        assert_eq!(issue.state(), Some(WorkState::Blocked));
    }

    #[test]
    fn closed_issue_rejects_mutations() {
        let store = SqliteStore::open_in_memory().expect("store");
        let issue = store
            .transaction(|tx| {
                let issue = tx.create_issue("t", "b", &LabelSet::new())?;
                tx.close_issue(issue.issue_ref)?;
                Ok(issue.issue_ref)
            })
            .expect("tx");
        let err = store
            .transaction(|tx| tx.add_label(issue, "x"))
            .unwrap_err();
        assert!(err.to_string().contains("is closed"));
        let err = store
            .transaction(|tx| tx.append_event(issue, "a", "b").map(|_| ()))
            .unwrap_err();
        assert!(err.to_string().contains("is closed"));
    }

    #[test]
    fn events_after_is_bounded_and_ordered() {
        let store = SqliteStore::open_in_memory().expect("store");
        store
            .transaction(|tx| {
                let a = tx.create_issue("a", "", &LabelSet::new())?.issue_ref;
                let b = tx.create_issue("b", "", &LabelSet::new())?.issue_ref;
                for n in 0..3 {
                    tx.append_event(a, "x", &format!("a{n}"))?;
                    tx.append_event(b, "x", &format!("b{n}"))?;
                }
                Ok(())
            })
            .expect("seed");
        let events = store.read(|tx| tx.events_after(2, 3)).expect("read");
        let ids: Vec<i64> = events.iter().map(|event| event.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(events[0].body, "a1");
    }

    #[test]
    fn label_filter_is_any_match_over_open_issues() {
        let store = SqliteStore::open_in_memory().expect("store");
        store
            .transaction(|tx| {
                tx.create_issue("1", "", &labels(&["to:backend"]))?;
                tx.create_issue("2", "", &labels(&["kind:task"]))?;
                tx.create_issue("3", "", &labels(&["to:qa"]))?;
                let closed = tx.create_issue("4", "", &labels(&["to:backend"]))?;
                tx.close_issue(closed.issue_ref)?;
                Ok(())
            })
            .expect("seed");
        let found = store
            .read(|tx| {
                tx.open_issues_with_any_label(&["to:backend".to_string(), "kind:task".to_string()])
            })
            .expect("read");
        assert_eq!(found, vec![IssueRef(1), IssueRef(2)]);
    }

    #[test]
    fn duplicate_quality_event_is_ignored() {
        let store = SqliteStore::open_in_memory().expect("store");
        let event = store
            .transaction(|tx| {
                let issue = tx.create_issue("t", "", &LabelSet::new())?.issue_ref;
                Ok(NewQualityEvent {
                    issue_ref: issue,
                    idempotency_key: "k1".to_string(),
                    source: "cli".to_string(),
                    category: "ci".to_string(),
                    result: "fail".to_string(),
                    evidence: vec!["https://ci/1".to_string()],
                    ..NewQualityEvent::default()
                })
            })
            .expect("seed");
        assert!(store.transaction(|tx| tx.insert_quality_event(&event)).expect("first"));
        assert!(!store.transaction(|tx| tx.insert_quality_event(&event)).expect("second"));
        let stored = store
            .read(|tx| tx.quality_events(event.issue_ref))
            .expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event, event);
    }
}
