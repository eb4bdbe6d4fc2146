//! The step loop and its persistence.
//!
//! - [`runner`]: the [`Orchestrator`] that drives kernels through the table
//! - [`checkpoint`]: versioned, atomically written state snapshots

pub mod checkpoint;
pub mod runner;

pub use checkpoint::{CHECKPOINT_VERSION, CheckpointHook, CheckpointRecord, CheckpointStore, NoopCheckpoint};
pub use runner::{FATAL_REPORT_FILE, FatalReport, Orchestrator};

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::{CheckpointError, WorkflowError};
use crate::kernels::{KernelDeps, KernelRegistry, recorded_attempts};
use crate::tracker::{IssueDetails, IssueEdit};
use crate::workflow::{FinalStatus, ImplementationState, TransitionTable, Tunables, WorkflowContext};

/// One issue run, fresh or resumed.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub issue: u64,
    pub worktree: PathBuf,
    /// Implementation plan. Empty means "use the issue's title and body".
    pub plan: String,
    pub instruction: Option<String>,
    /// Continue from the issue's checkpoint when one exists.
    pub resume: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub status: FinalStatus,
    pub context: WorkflowContext,
}

/// Run the standard kernels for one issue, checkpointing into the configured
/// artifact directory.
///
/// With `resume` set, an existing checkpoint must belong to the same issue
/// and working copy; a missing checkpoint starts fresh. Once the run ends the
/// tracker is told according to `[tracker]`; those calls never change the
/// outcome.
pub async fn run_issue(deps: &KernelDeps, request: RunRequest) -> Result<RunOutcome, WorkflowError> {
    let config = deps.config.clone();
    let mut store = CheckpointStore::for_issue(&config, &request.worktree, request.issue);

    let artifact_dir = config.paths.artifact_dir_in(&request.worktree);
    let state = if request.resume {
        match store.resume(request.issue, &request.worktree) {
            Ok(mut state) => {
                // A crash between a diagnostic write and the next checkpoint
                // leaves the saved counter behind what is on disk.
                let on_disk = recorded_attempts(&artifact_dir).map_err(|source| {
                    WorkflowError::Artifacts {
                        path: artifact_dir.clone(),
                        source,
                    }
                })?;
                for (stage, attempt) in on_disk {
                    let saved = state.attempts.entry(stage).or_insert(0);
                    *saved = (*saved).max(attempt);
                }
                info!(
                    issue = request.issue,
                    stage = %state.current_stage,
                    iteration = state.iteration,
                    "resuming from checkpoint"
                );
                state
            }
            Err(CheckpointError::NotFound { .. }) => {
                ImplementationState::new(request.issue, &request.worktree)
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        ImplementationState::new(request.issue, &request.worktree)
    };

    let resumed_terminal = state.is_terminal();
    let plan = if request.plan.trim().is_empty() && !resumed_terminal {
        let details = deps
            .tracker
            .view_issue(request.issue)
            .await
            .map_err(|source| WorkflowError::Issue {
                issue: request.issue,
                source,
            })?;
        info!(issue = request.issue, title = %details.title, "plan taken from the issue");
        plan_from_issue(&details)
    } else {
        request.plan
    };

    let mut context = WorkflowContext::new(state, plan, Tunables::from_config(&config));
    if let Some(instruction) = request.instruction {
        context = context.with_instruction(instruction);
    }

    let orchestrator = Orchestrator::new(
        TransitionTable::standard(),
        KernelRegistry::standard(deps),
        config.workflow.max_steps,
    )?
    .with_report_dir(artifact_dir.clone());

    let status = orchestrator.run(&mut context, &mut store).await?;
    if !resumed_terminal {
        announce(deps, &context, status, &artifact_dir).await;
    }
    Ok(RunOutcome { status, context })
}

/// Plan for an issue run without one: the issue's title and body.
pub fn plan_from_issue(issue: &IssueDetails) -> String {
    let title = issue.title.trim();
    let body = issue.body.trim();
    if body.is_empty() {
        format!("# {}", title)
    } else {
        format!("# {}\n\n{}", title, body)
    }
}

async fn announce(deps: &KernelDeps, ctx: &WorkflowContext, status: FinalStatus, artifact_dir: &Path) {
    let issue = ctx.state.issue;
    let settings = &deps.config.tracker;
    match status {
        FinalStatus::Finished => {
            let Some(label) = &settings.pr_label else {
                return;
            };
            let edit = IssueEdit {
                add_labels: vec![label.clone()],
                ..Default::default()
            };
            match deps.tracker.edit_issue(issue, &edit).await {
                Ok(()) => info!(issue, %label, "issue labelled"),
                Err(e) => warn!(issue, %label, error = %e, "failed to label issue"),
            }
        }
        FinalStatus::Fatal => {
            if !settings.report_fatal {
                return;
            }
            let stage = ctx
                .state
                .history
                .last()
                .map(|r| r.stage.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let title = format!("issueflow run for #{} failed in {}", issue, stage);
            let body = format!(
                "The run for #{} ended fatal in stage '{}' at iteration {}.\n\nReason: {}\n\nReport: {}",
                issue,
                stage,
                ctx.state.iteration,
                ctx.fatal_reason.as_deref().unwrap_or("unknown"),
                artifact_dir.join(FATAL_REPORT_FILE).display(),
            );
            match deps
                .tracker
                .create_issue(&title, &body, &settings.fatal_labels)
                .await
            {
                Ok(created) => info!(issue, follow_up = created.number, url = %created.url, "fatal run reported"),
                Err(e) => warn!(issue, error = %e, "failed to report fatal run"),
            }
        }
    }
}
