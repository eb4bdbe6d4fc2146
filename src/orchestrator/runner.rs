use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};
use uuid::Uuid;

use super::checkpoint::CheckpointHook;
use crate::errors::{TableError, WorkflowError};
use crate::kernels::KernelRegistry;
use crate::util::write_atomic;
use crate::workflow::{FinalStatus, Stage, StageRecord, TransitionTable, WorkflowContext};

pub const FATAL_REPORT_FILE: &str = "fatal-report.json";

/// Written to the report directory when a run ends in `fatal`.
#[derive(Debug, Clone, Serialize)]
pub struct FatalReport {
    pub issue: u64,
    pub run_id: Uuid,
    /// Stage whose step ended the run.
    pub stage: Stage,
    pub iteration: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub history: Vec<StageRecord>,
}

/// Drives the step loop over a validated transition table and kernel set.
pub struct Orchestrator {
    table: TransitionTable,
    kernels: KernelRegistry,
    max_steps: u32,
    report_dir: Option<PathBuf>,
}

impl Orchestrator {
    /// Validate the table, then check every kernel: no kernel on a terminal
    /// stage, and every event a kernel declares has an edge.
    pub fn new(
        table: TransitionTable,
        kernels: KernelRegistry,
        max_steps: u32,
    ) -> Result<Self, WorkflowError> {
        table.validate()?;
        for kernel in kernels.iter() {
            let stage = kernel.stage();
            if stage.is_terminal() {
                return Err(TableError::TerminalKernel(stage).into());
            }
            if let Some(event) = kernel
                .emits()
                .iter()
                .find(|event| !table.contains(stage, **event))
            {
                return Err(TableError::UnroutedEmission {
                    stage,
                    event: *event,
                }
                .into());
            }
        }
        Ok(Self {
            table,
            kernels,
            max_steps,
            report_dir: None,
        })
    }

    /// Write `fatal-report.json` into `dir` when a run ends in `fatal`.
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Run until `finish`, `fatal`, or the step ceiling.
    ///
    /// Kernel errors, missing kernels, unrouted events and the step ceiling
    /// all end the run as `fatal` with a reason. Only checkpoint and report
    /// write failures are returned as errors.
    pub async fn run(
        &self,
        ctx: &mut WorkflowContext,
        hook: &mut dyn CheckpointHook,
    ) -> Result<FinalStatus, WorkflowError> {
        let issue = ctx.state.issue;

        // A terminal checkpoint is left as it is, report included.
        if ctx.state.is_terminal() {
            let status = match ctx.stage() {
                Stage::Finish => FinalStatus::Finished,
                _ => FinalStatus::Fatal,
            };
            info!(issue, stage = %ctx.stage(), "run already terminal, nothing to do");
            ctx.final_status = Some(status);
            return Ok(status);
        }

        let mut steps: u32 = 0;
        let mut last_stage = ctx.stage();

        info!(issue, run_id = %ctx.run_id, stage = %ctx.stage(), iteration = ctx.state.iteration, "workflow starting");

        while !ctx.state.is_terminal() {
            if steps >= self.max_steps {
                self.fail(ctx, format!("Step ceiling ({}) exceeded", self.max_steps));
                break;
            }
            hook.checkpoint(ctx)?;
            steps += 1;

            let stage = ctx.stage();
            last_stage = stage;
            let Some(kernel) = self.kernels.get(stage) else {
                self.fail(ctx, format!("No kernel registered for stage '{}'", stage));
                break;
            };

            let attempt = ctx.bump_attempt(stage);
            let iteration = ctx.state.iteration;
            let result = match kernel.run(ctx).await {
                Ok(result) => result,
                Err(e) => {
                    self.fail(ctx, format!("Stage '{}' failed: {:#}", stage, e));
                    break;
                }
            };
            ctx.merge_result(stage, &result);

            let next = match self.table.next_stage(stage, result.event) {
                Ok(next) => next,
                Err(e) => {
                    self.fail(ctx, e.to_string());
                    break;
                }
            };
            if next == Stage::Fatal {
                ctx.fatal_reason = Some(result.reason.clone().unwrap_or_else(|| {
                    format!("Stage '{}' reported {}", stage, result.event)
                }));
            }

            info!(
                issue,
                stage = %stage,
                event = %result.event,
                next = %next,
                iteration,
                attempt,
                reason = result.reason.as_deref().unwrap_or(""),
                "step"
            );
            ctx.state.current_stage = next;
        }

        let status = match ctx.stage() {
            Stage::Finish => FinalStatus::Finished,
            _ => FinalStatus::Fatal,
        };
        ctx.final_status = Some(status);
        hook.checkpoint(ctx)?;

        match status {
            FinalStatus::Finished => {
                info!(issue, steps, pr_url = ?ctx.state.pr_url, "workflow finished");
            }
            FinalStatus::Fatal => {
                error!(issue, steps, reason = ?ctx.fatal_reason, "workflow ended fatally");
                self.write_fatal_report(ctx, last_stage)?;
            }
        }
        Ok(status)
    }

    /// End the run from the orchestrator side. History is left untouched;
    /// only kernels append to it.
    fn fail(&self, ctx: &mut WorkflowContext, reason: String) {
        error!(issue = ctx.state.issue, stage = %ctx.stage(), %reason, "fatal");
        ctx.fatal_reason = Some(reason);
        ctx.state.current_stage = Stage::Fatal;
    }

    fn write_fatal_report(&self, ctx: &WorkflowContext, stage: Stage) -> Result<(), WorkflowError> {
        let Some(dir) = &self.report_dir else {
            return Ok(());
        };
        let path = dir.join(FATAL_REPORT_FILE);
        let report = FatalReport {
            issue: ctx.state.issue,
            run_id: ctx.run_id,
            stage,
            iteration: ctx.state.iteration,
            reason: ctx
                .fatal_reason
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            timestamp: Utc::now(),
            history: ctx.state.history.clone(),
        };
        let report_error = |source: std::io::Error| WorkflowError::Report {
            path: path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(&report).map_err(|e| report_error(e.into()))?;
        write_atomic(&path, &bytes).map_err(report_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CheckpointError;
    use crate::orchestrator::checkpoint::NoopCheckpoint;
    use crate::test_support::ScriptedKernel;
    use crate::workflow::{Event, ImplementationState, Tunables};
    use tempfile::tempdir;

    const IMPL_EVENTS: &[Event] = &[Event::ImplNotDone, Event::ImplDone, Event::Fatal];
    const REVIEW_EVENTS: &[Event] = &[Event::ReviewPass, Event::ReviewFail];
    const PR_EVENTS: &[Event] = &[Event::PrPass, Event::PrFailNeedRebase];
    const REBASE_EVENTS: &[Event] = &[Event::RebaseOk, Event::RebaseConflict];

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(ImplementationState::new(1, "/w"), "plan", Tunables::default())
    }

    fn registry(
        impl_events: Vec<Event>,
        review_events: Vec<Event>,
        pr_events: Vec<Event>,
        rebase_events: Vec<Event>,
    ) -> KernelRegistry {
        let mut registry = KernelRegistry::new();
        registry.register(ScriptedKernel::new(Stage::Impl, IMPL_EVENTS, impl_events));
        registry.register(ScriptedKernel::new(Stage::Review, REVIEW_EVENTS, review_events));
        registry.register(ScriptedKernel::new(Stage::Pr, PR_EVENTS, pr_events));
        registry.register(ScriptedKernel::new(Stage::Rebase, REBASE_EVENTS, rebase_events));
        registry
    }

    /// Records the stage seen at each checkpoint.
    #[derive(Default)]
    struct RecordingHook {
        stages: Vec<Stage>,
    }

    impl CheckpointHook for RecordingHook {
        fn checkpoint(&mut self, ctx: &WorkflowContext) -> Result<(), CheckpointError> {
            self.stages.push(ctx.stage());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_happy_path_runs_each_stage_once() {
        let orchestrator = Orchestrator::new(
            TransitionTable::standard(),
            registry(
                vec![Event::ImplDone],
                vec![Event::ReviewPass],
                vec![Event::PrPass],
                vec![],
            ),
            100,
        )
        .unwrap();
        let mut ctx = ctx();
        let mut hook = RecordingHook::default();

        let status = orchestrator.run(&mut ctx, &mut hook).await.unwrap();
        assert_eq!(status, FinalStatus::Finished);
        assert_eq!(ctx.stage(), Stage::Finish);
        assert_eq!(ctx.attempts_for(Stage::Impl), 1);
        assert_eq!(ctx.attempts_for(Stage::Review), 1);
        assert_eq!(ctx.attempts_for(Stage::Pr), 1);
        assert_eq!(ctx.attempts_for(Stage::Rebase), 0);
        assert_eq!(
            hook.stages,
            vec![Stage::Impl, Stage::Review, Stage::Pr, Stage::Finish]
        );
        assert_eq!(ctx.final_status, Some(FinalStatus::Finished));
    }

    #[tokio::test]
    async fn test_rebase_detour_returns_to_pr() {
        let orchestrator = Orchestrator::new(
            TransitionTable::standard(),
            registry(
                vec![Event::ImplDone],
                vec![Event::ReviewPass],
                vec![Event::PrFailNeedRebase, Event::PrPass],
                vec![Event::RebaseOk],
            ),
            100,
        )
        .unwrap();
        let mut ctx = ctx();
        let status = orchestrator.run(&mut ctx, &mut NoopCheckpoint).await.unwrap();
        assert_eq!(status, FinalStatus::Finished);
        assert_eq!(ctx.attempts_for(Stage::Pr), 2);
        assert_eq!(ctx.attempts_for(Stage::Rebase), 1);
    }

    #[tokio::test]
    async fn test_rebase_conflict_is_fatal_with_report() {
        let dir = tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            TransitionTable::standard(),
            registry(
                vec![Event::ImplDone],
                vec![Event::ReviewPass],
                vec![Event::PrFailNeedRebase],
                vec![Event::RebaseConflict],
            ),
            100,
        )
        .unwrap()
        .with_report_dir(dir.path());
        let mut ctx = ctx();

        let status = orchestrator.run(&mut ctx, &mut NoopCheckpoint).await.unwrap();
        assert_eq!(status, FinalStatus::Fatal);
        assert_eq!(ctx.stage(), Stage::Fatal);

        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(FATAL_REPORT_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(report["stage"], "rebase");
        assert_eq!(report["reason"], "Stage 'rebase' reported rebase_conflict");
        assert_eq!(report["history"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_terminal_state_is_left_untouched() {
        let dir = tempdir().unwrap();
        let report = dir.path().join(FATAL_REPORT_FILE);
        std::fs::write(&report, r#"{"reason": "Merge conflict in parser.py"}"#).unwrap();
        let orchestrator = Orchestrator::new(
            TransitionTable::standard(),
            registry(vec![], vec![], vec![], vec![]),
            100,
        )
        .unwrap()
        .with_report_dir(dir.path());
        let mut ctx = ctx();
        ctx.state.current_stage = Stage::Fatal;
        let mut hook = RecordingHook::default();

        let status = orchestrator.run(&mut ctx, &mut hook).await.unwrap();
        assert_eq!(status, FinalStatus::Fatal);
        assert!(hook.stages.is_empty());
        assert!(ctx.state.history.is_empty());
        assert_eq!(
            std::fs::read_to_string(&report).unwrap(),
            r#"{"reason": "Merge conflict in parser.py"}"#
        );

        ctx.state.current_stage = Stage::Finish;
        let status = orchestrator.run(&mut ctx, &mut hook).await.unwrap();
        assert_eq!(status, FinalStatus::Finished);
        assert!(hook.stages.is_empty());
    }

    #[tokio::test]
    async fn test_missing_kernel_is_fatal() {
        let mut kernels = registry(vec![Event::ImplDone], vec![], vec![], vec![]);
        kernels.remove(Stage::Review);
        let orchestrator = Orchestrator::new(TransitionTable::standard(), kernels, 100).unwrap();
        let mut ctx = ctx();

        let status = orchestrator.run(&mut ctx, &mut NoopCheckpoint).await.unwrap();
        assert_eq!(status, FinalStatus::Fatal);
        assert!(ctx.fatal_reason.unwrap().contains("No kernel registered for stage 'review'"));
        assert_eq!(ctx.state.history.len(), 1);
    }

    #[tokio::test]
    async fn test_kernel_error_is_fatal_with_message() {
        let orchestrator = Orchestrator::new(
            TransitionTable::standard(),
            registry(vec![], vec![], vec![], vec![]),
            100,
        )
        .unwrap();
        let mut ctx = ctx();
        let status = orchestrator.run(&mut ctx, &mut NoopCheckpoint).await.unwrap();
        assert_eq!(status, FinalStatus::Fatal);
        assert!(ctx.fatal_reason.unwrap().contains("no scripted event left"));
    }

    #[tokio::test]
    async fn test_undeclared_event_without_edge_is_fatal() {
        // Review declares only its own events but emits pr_pass.
        let kernels = registry(vec![Event::ImplDone], vec![Event::PrPass], vec![], vec![]);
        let orchestrator = Orchestrator::new(TransitionTable::standard(), kernels, 100).unwrap();
        let mut ctx = ctx();

        let status = orchestrator.run(&mut ctx, &mut NoopCheckpoint).await.unwrap();
        assert_eq!(status, FinalStatus::Fatal);
        let reason = ctx.fatal_reason.unwrap();
        assert!(reason.contains("pr_pass"));
        assert!(reason.contains("review"));
    }

    #[tokio::test]
    async fn test_step_ceiling_is_fatal() {
        let orchestrator = Orchestrator::new(
            TransitionTable::standard(),
            registry(vec![Event::ImplNotDone; 10], vec![], vec![], vec![]),
            5,
        )
        .unwrap();
        let mut ctx = ctx();
        let status = orchestrator.run(&mut ctx, &mut NoopCheckpoint).await.unwrap();
        assert_eq!(status, FinalStatus::Fatal);
        assert_eq!(ctx.attempts_for(Stage::Impl), 5);
        assert!(ctx.fatal_reason.unwrap().contains("Step ceiling (5)"));
    }

    #[tokio::test]
    async fn test_kernel_fatal_reason_is_kept() {
        let orchestrator = Orchestrator::new(
            TransitionTable::standard(),
            registry(vec![Event::Fatal], vec![], vec![], vec![]),
            100,
        )
        .unwrap();
        let mut ctx = ctx();
        let status = orchestrator.run(&mut ctx, &mut NoopCheckpoint).await.unwrap();
        assert_eq!(status, FinalStatus::Fatal);
        assert_eq!(
            ctx.fatal_reason.as_deref(),
            Some("Stage 'impl' reported fatal")
        );
    }

    #[test]
    fn test_unrouted_emission_rejected_at_startup() {
        let table = TransitionTable::standard();
        let mut kernels = registry(vec![], vec![], vec![], vec![]);
        kernels.register(ScriptedKernel::new(
            Stage::Rebase,
            &[Event::RebaseOk, Event::ImplDone],
            vec![],
        ));
        let err = Orchestrator::new(table, kernels, 100).err().unwrap();
        assert!(matches!(
            err,
            WorkflowError::Table(TableError::UnroutedEmission {
                stage: Stage::Rebase,
                event: Event::ImplDone
            })
        ));
    }

    #[test]
    fn test_terminal_kernel_rejected_at_startup() {
        let mut kernels = registry(vec![], vec![], vec![], vec![]);
        kernels.register(ScriptedKernel::new(Stage::Finish, &[], vec![]));
        let err = Orchestrator::new(TransitionTable::standard(), kernels, 100)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            WorkflowError::Table(TableError::TerminalKernel(Stage::Finish))
        ));
    }

    #[test]
    fn test_invalid_table_rejected_at_startup() {
        let mut table = TransitionTable::standard();
        table.remove(Stage::Pr, Event::PrPass);
        let err = Orchestrator::new(table, KernelRegistry::new(), 100)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            WorkflowError::Table(TableError::MissingEdge {
                stage: Stage::Pr,
                event: Event::PrPass
            })
        ));
    }
}
