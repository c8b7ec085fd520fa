//! `outbox` CLI: sync ticks, worker entry point, quality ingestion, the
//! codex pipeline and manual issue operations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use outbox::core::types::{IssueRef, Role, WorkState};
use outbox::error::is_validation;
use outbox::exit_codes;
use outbox::io::cache::JsonFileCache;
use outbox::io::codex::CodexExecRunner;
use outbox::io::config::{WorkflowProfile, load_profile};
use outbox::io::store::SqliteStore;
use outbox::issues::{self, Transition};
use outbox::logging;
use outbox::pipeline::{
    DEFAULT_MAX_REVIEW_ROUND, DEFAULT_MAX_TEST_ROUND, PipelineRequest, run_pipeline,
};
use outbox::quality::{self, IngestRequest};
use outbox::sync::{DEFAULT_EVENT_BATCH, SyncEngine, SyncRequest};
use outbox::worker::run_worker;

#[derive(Parser)]
#[command(
    name = "outbox",
    version,
    about = "Outbox orchestrator for role-based coding-agent workers"
)]
struct Cli {
    /// Workflow profile (TOML).
    #[arg(long, global = true, default_value = "workflow.toml")]
    workflow: PathBuf,
    /// Issue store database.
    #[arg(long, global = true, default_value = ".outbox/outbox.db")]
    db: PathBuf,
    /// Cursor / run-token cache file.
    #[arg(long, global = true, default_value = ".outbox/cache.json")]
    cache: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sync tick for a role.
    Sync {
        #[arg(long)]
        role: Role,
        /// Actor the role drives issues for (default `lead-<role>`).
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long, default_value_t = DEFAULT_EVENT_BATCH)]
        event_batch: usize,
        /// Root directory for context packs.
        #[arg(long, default_value = ".outbox/runs")]
        pack_root: PathBuf,
    },
    /// Spawn a worker for one issue now, ignoring the state-based skip.
    Dispatch {
        #[arg(long)]
        role: Role,
        #[arg(long)]
        issue: IssueRef,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long, default_value = ".outbox/runs")]
        pack_root: PathBuf,
    },
    /// Worker-side commands (invoked by the sync engine).
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Review / CI signal ingestion.
    Quality {
        #[command(subcommand)]
        command: QualityCommand,
    },
    /// Codex coding → review → test pipeline.
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommand,
    },
    /// Report merge readiness; exits 3 when not ready.
    MergeCheck {
        #[arg(long)]
        issue: IssueRef,
    },
    /// Manual issue operations.
    Issue {
        #[command(subcommand)]
        command: IssueCommand,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Execute a context pack's work order and write its result.
    Run {
        #[arg(long)]
        context_pack: PathBuf,
    },
}

#[derive(Subcommand)]
enum QualityCommand {
    Ingest(IngestArgs),
}

#[derive(Args)]
struct IngestArgs {
    #[arg(long)]
    issue: IssueRef,
    #[arg(long, default_value = "cli")]
    source: String,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    result: Option<String>,
    #[arg(long)]
    actor: Option<String>,
    #[arg(long)]
    summary: Option<String>,
    #[arg(long = "evidence")]
    evidence: Vec<String>,
    /// Raw provider payload (JSON file) for field inference.
    #[arg(long)]
    payload_file: Option<PathBuf>,
    /// Explicit idempotency key.
    #[arg(long)]
    event_key: Option<String>,
    #[arg(long)]
    external_event_id: Option<String>,
    /// Provider event name, e.g. `check_run`.
    #[arg(long)]
    event_kind: Option<String>,
}

#[derive(Subcommand)]
enum PipelineCommand {
    Run(PipelineArgs),
}

#[derive(Args)]
struct PipelineArgs {
    #[arg(long)]
    issue: IssueRef,
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
    #[arg(long)]
    prompt_file: PathBuf,
    #[arg(long, default_value = "backend")]
    coding_role: Role,
    #[arg(long, default_value_t = DEFAULT_MAX_REVIEW_ROUND)]
    max_review_round: u32,
    #[arg(long, default_value_t = DEFAULT_MAX_TEST_ROUND)]
    max_test_round: u32,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value = ".outbox/pipeline")]
    artifacts_root: PathBuf,
    /// Codex executable.
    #[arg(long, default_value = "codex")]
    codex_bin: PathBuf,
}

#[derive(Subcommand)]
enum IssueCommand {
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    Claim {
        #[arg(long)]
        issue: IssueRef,
        #[arg(long)]
        actor: String,
    },
    Transition {
        #[arg(long)]
        issue: IssueRef,
        #[arg(long)]
        state: WorkState,
        #[arg(long)]
        actor: String,
    },
    Comment {
        #[arg(long)]
        issue: IssueRef,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        body: String,
    },
    Close {
        #[arg(long)]
        issue: IssueRef,
        #[arg(long)]
        actor: String,
        /// Inline closing comment carrying Changes/Tests evidence.
        #[arg(long)]
        comment: Option<String>,
    },
    Label {
        #[command(subcommand)]
        command: LabelCommand,
    },
}

#[derive(Subcommand)]
enum LabelCommand {
    Add {
        #[arg(long)]
        issue: IssueRef,
        #[arg(long)]
        label: String,
    },
    Remove {
        #[arg(long)]
        issue: IssueRef,
        #[arg(long)]
        label: String,
    },
}

fn main() {
    logging::init(logging::DEFAULT_DIRECTIVE);
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if is_validation(&err) {
                exit_codes::INVALID
            } else {
                exit_codes::FAILED
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Command::Sync {
            role,
            assignee,
            event_batch,
            pack_root,
        } => {
            let (profile, store, cache) = open_all(&cli)?;
            let engine = SyncEngine::new(&store, &cache, &profile, &cli.workflow, pack_root)?;
            let report = engine.sync(&SyncRequest {
                role: *role,
                assignee: assignee.clone(),
                event_batch: *event_batch,
            })?;
            print_json(&report)?;
            Ok(exit_codes::OK)
        }
        Command::Dispatch {
            role,
            issue,
            assignee,
            pack_root,
        } => {
            let (profile, store, cache) = open_all(&cli)?;
            let engine = SyncEngine::new(&store, &cache, &profile, &cli.workflow, pack_root)?;
            let outcome = engine.dispatch(*role, *issue, assignee.as_deref())?;
            println!("{outcome:?}");
            Ok(if outcome.blocked() {
                exit_codes::BLOCKED
            } else {
                exit_codes::OK
            })
        }
        Command::Worker {
            command: WorkerCommand::Run { context_pack },
        } => {
            let profile = load_profile(&cli.workflow)?;
            let result = run_worker(context_pack, &profile)?;
            print_json(&result)?;
            Ok(exit_codes::OK)
        }
        Command::Quality {
            command: QualityCommand::Ingest(args),
        } => {
            let store = SqliteStore::open(&cli.db)?;
            let payload = args
                .payload_file
                .as_deref()
                .map(|path| {
                    fs::read_to_string(path)
                        .with_context(|| format!("read payload {}", path.display()))
                })
                .transpose()?;
            let outcome = quality::ingest(
                &store,
                &IngestRequest {
                    issue_ref: args.issue,
                    source: args.source.clone(),
                    category: args.category.clone(),
                    result: args.result.clone(),
                    actor: args.actor.clone(),
                    summary: args.summary.clone(),
                    evidence: args.evidence.clone(),
                    payload,
                    event_key: args.event_key.clone(),
                    external_event_id: args.external_event_id.clone(),
                    event_kind: args.event_kind.clone(),
                },
            )?;
            print_json(&outcome)?;
            Ok(exit_codes::OK)
        }
        Command::Pipeline {
            command: PipelineCommand::Run(args),
        } => {
            let store = SqliteStore::open(&cli.db)?;
            let run_id = args.run_id.clone().unwrap_or_else(|| {
                format!(
                    "{}-{}-pipeline",
                    Utc::now().format("%Y%m%d%H%M%S"),
                    args.coding_role
                )
            });
            let runner = CodexExecRunner {
                program: args.codex_bin.clone(),
                ..CodexExecRunner::default()
            };
            let request = PipelineRequest {
                issue_ref: args.issue,
                project_dir: args.project_dir.clone(),
                prompt_file: args.prompt_file.clone(),
                coding_role: args.coding_role,
                max_review_round: args.max_review_round,
                max_test_round: args.max_test_round,
                artifacts_dir: args
                    .artifacts_root
                    .join(args.issue.id().to_string())
                    .join(&run_id),
                run_id,
            };
            let outcome = run_pipeline(&store, &runner, &request)?;
            print_json(&outcome)?;
            Ok(if outcome.ready_to_merge {
                exit_codes::OK
            } else {
                exit_codes::BLOCKED
            })
        }
        Command::MergeCheck { issue } => {
            let store = SqliteStore::open(&cli.db)?;
            let readiness = issues::merge_check(&store, *issue)?;
            println!("{}", readiness.reason);
            Ok(if readiness.ready {
                exit_codes::OK
            } else {
                exit_codes::BLOCKED
            })
        }
        Command::Issue { command } => {
            let store = SqliteStore::open(&cli.db)?;
            run_issue(&store, command)
        }
    }
}

fn run_issue(store: &SqliteStore, command: &IssueCommand) -> Result<i32> {
    match command {
        IssueCommand::Create {
            title,
            body,
            labels,
        } => {
            let issue = issues::create(store, title, body, labels)?;
            println!("{}", issue.issue_ref);
        }
        IssueCommand::Claim { issue, actor } => {
            issues::claim(store, *issue, actor)?;
        }
        IssueCommand::Transition {
            issue,
            state,
            actor,
        } => return Ok(transition_code(issues::transition(store, *issue, *state, actor)?)),
        IssueCommand::Comment { issue, actor, body } => {
            let event = issues::comment(store, *issue, actor, body)?;
            println!("e{}", event.id);
        }
        IssueCommand::Close {
            issue,
            actor,
            comment,
        } => {
            return Ok(transition_code(issues::close(
                store,
                *issue,
                actor,
                comment.as_deref(),
            )?));
        }
        IssueCommand::Label { command } => match command {
            LabelCommand::Add { issue, label } => {
                issues::add_label(store, *issue, label)?;
            }
            LabelCommand::Remove { issue, label } => {
                issues::remove_label(store, *issue, label)?;
            }
        },
    }
    Ok(exit_codes::OK)
}

fn transition_code(transition: Transition) -> i32 {
    match transition {
        Transition::Applied(state) => {
            println!("{state}");
            exit_codes::OK
        }
        Transition::Blocked(err) => {
            eprintln!("blocked: {err}");
            exit_codes::BLOCKED
        }
    }
}

fn open_all(cli: &Cli) -> Result<(WorkflowProfile, SqliteStore, JsonFileCache)> {
    let profile = load_profile(&cli.workflow)?;
    let store = SqliteStore::open(&cli.db)?;
    let cache = JsonFileCache::open(absolute(&cli.cache)?)?;
    Ok((profile, store, cache))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolve {}", path.display()))
}

/// Pretty-printed JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sync_with_defaults() {
        let cli = Cli::parse_from(["outbox", "sync", "--role", "backend"]);
        assert_eq!(cli.workflow, PathBuf::from("workflow.toml"));
        match cli.command {
            Command::Sync {
                role, event_batch, ..
            } => {
                assert_eq!(role, Role::Backend);
                assert_eq!(event_batch, DEFAULT_EVENT_BATCH);
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn worker_run_accepts_trailing_workflow() {
        let cli = Cli::parse_from([
            "outbox",
            "worker",
            "run",
            "--context-pack",
            "/tmp/pack",
            "--workflow",
            "/etc/wf.toml",
        ]);
        assert_eq!(cli.workflow, PathBuf::from("/etc/wf.toml"));
        assert!(matches!(
            cli.command,
            Command::Worker {
                command: WorkerCommand::Run { .. }
            }
        ));
    }

    #[test]
    fn issue_refs_and_roles_are_validated_at_parse_time() {
        assert!(Cli::try_parse_from(["outbox", "merge-check", "--issue", "42"]).is_err());
        assert!(Cli::try_parse_from(["outbox", "sync", "--role", "pm"]).is_err());
        let cli = Cli::try_parse_from(["outbox", "merge-check", "--issue", "local#42"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Command::MergeCheck {
                issue: IssueRef(42)
            }
        ));
    }

    #[test]
    fn quality_ingest_collects_repeated_evidence() {
        let cli = Cli::parse_from([
            "outbox",
            "quality",
            "ingest",
            "--issue",
            "local#1",
            "--category",
            "ci",
            "--result",
            "fail",
            "--evidence",
            "a",
            "--evidence",
            "b",
        ]);
        let Command::Quality {
            command: QualityCommand::Ingest(args),
        } = cli.command
        else {
            panic!("expected quality ingest");
        };
        assert_eq!(args.evidence, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(args.source, "cli");
    }
}
