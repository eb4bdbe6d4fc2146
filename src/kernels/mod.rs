//! Stage kernels: one unit of work per non-terminal stage.
//!
//! A kernel reads and mutates the [`WorkflowContext`], talks to its
//! collaborators and reports exactly one [`Event`]. It never picks the next
//! stage; the orchestrator does that through the transition table.

pub mod impl_stage;
pub mod pr;
pub mod prompts;
pub mod rebase;
pub mod review;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::warn;

use crate::backend::GenerationBackend;
use crate::config::EngineConfig;
use crate::process::CommandRunner;
use crate::review::HeuristicVerdictExtractor;
use crate::tracker::{IssueTracker, VersionControl, detect_base, detect_remote};
use crate::util::write_atomic;
use crate::workflow::{Event, Stage, StageResult, WorkflowContext};

pub use impl_stage::ImplKernel;
pub use pr::PrKernel;
pub use rebase::RebaseKernel;
pub use review::ReviewKernel;

#[async_trait]
pub trait StageKernel: Send + Sync {
    fn stage(&self) -> Stage;

    /// Every event this kernel can report. Checked against the transition
    /// table before a run starts.
    fn emits(&self) -> &'static [Event];

    /// Run one attempt. An `Err` ends the run as fatal with its message.
    async fn run(&self, ctx: &mut WorkflowContext) -> Result<StageResult>;
}

/// Kernels keyed by the stage they handle.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: BTreeMap<Stage, Box<dyn StageKernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Impl, review, pr and rebase kernels over the given collaborators.
    pub fn standard(deps: &KernelDeps) -> Self {
        let mut registry = Self::new();
        registry.register(ImplKernel::new(deps.clone()));
        registry.register(ReviewKernel::new(
            deps.clone(),
            Box::new(HeuristicVerdictExtractor),
        ));
        registry.register(PrKernel::new(deps.clone()));
        registry.register(RebaseKernel::new(deps.clone()));
        registry
    }

    /// Register `kernel`, replacing any kernel for the same stage.
    pub fn register(&mut self, kernel: impl StageKernel + 'static) {
        self.kernels.insert(kernel.stage(), Box::new(kernel));
    }

    pub fn get(&self, stage: Stage) -> Option<&dyn StageKernel> {
        self.kernels.get(&stage).map(|k| k.as_ref())
    }

    pub fn remove(&mut self, stage: Stage) -> Option<Box<dyn StageKernel>> {
        self.kernels.remove(&stage)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn StageKernel> {
        self.kernels.values().map(|k| k.as_ref())
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

/// Collaborators and settings shared by the standard kernels.
#[derive(Clone)]
pub struct KernelDeps {
    pub backend: Arc<dyn GenerationBackend>,
    pub vcs: Arc<dyn VersionControl>,
    pub tracker: Arc<dyn IssueTracker>,
    pub runner: Arc<dyn CommandRunner>,
    pub config: Arc<EngineConfig>,
}

impl KernelDeps {
    pub fn artifact_dir(&self, ctx: &WorkflowContext) -> PathBuf {
        self.config.paths.artifact_dir_in(&ctx.state.worktree)
    }

    /// Remote and base branch for push/rebase: configured overrides first,
    /// then detection.
    pub async fn push_target(&self, ctx: &WorkflowContext) -> Result<(String, String)> {
        let remote = match &ctx.tunables.remote {
            Some(remote) => remote.clone(),
            None => detect_remote(self.vcs.as_ref()).await?,
        };
        let base = match &ctx.tunables.base_branch {
            Some(base) => base.clone(),
            None => detect_base(self.vcs.as_ref(), &remote).await?,
        };
        Ok((remote, base))
    }
}

/// One JSON record per kernel invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostic {
    pub event: Event,
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub details: Value,
    /// Stage-specific fields (the result payload), inlined.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StageDiagnostic {
    pub fn from_result(result: &StageResult, details: Value) -> Self {
        Self {
            event: result.event,
            pass: result.event.is_pass(),
            reason: result.reason.clone(),
            details,
            extra: result.payload.clone(),
        }
    }
}

/// `<stage>-iter-<iteration>-attempt-<attempt>.json`
pub fn diagnostic_file_name(stage: Stage, iteration: u32, attempt: u32) -> String {
    format!("{}-iter-{}-attempt-{}.json", stage, iteration, attempt)
}

static DIAGNOSTIC_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]+)-iter-\d+-attempt-(\d+)\.json$").unwrap());

/// Highest attempt number per stage among the diagnostics already in `dir`.
/// A missing directory has none.
pub fn recorded_attempts(dir: &Path) -> std::io::Result<BTreeMap<Stage, u32>> {
    let mut found = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let name = entry?.file_name();
        let Some(caps) = name.to_str().and_then(|n| DIAGNOSTIC_NAME_REGEX.captures(n)) else {
            continue;
        };
        let (Ok(stage), Ok(attempt)) = (caps[1].parse::<Stage>(), caps[2].parse::<u32>()) else {
            continue;
        };
        let slot = found.entry(stage).or_insert(0);
        *slot = (*slot).max(attempt);
    }
    Ok(found)
}

/// Write the diagnostic for one kernel invocation and attach its path as an
/// artifact.
///
/// Iteration and attempt are the values the attempt started with. A failed
/// attempt still gets a diagnostic (event `fatal`, the error chain as
/// reason) before its error is passed on.
pub fn finish_attempt(
    dir: &Path,
    stage: Stage,
    iteration: u32,
    attempt: u32,
    outcome: Result<(StageResult, Value)>,
) -> Result<StageResult> {
    let path = dir.join(diagnostic_file_name(stage, iteration, attempt));
    match outcome {
        Ok((mut result, details)) => {
            let diagnostic = StageDiagnostic::from_result(&result, details);
            write_atomic(&path, &serde_json::to_vec_pretty(&diagnostic)?)?;
            result.artifacts.push(path);
            Ok(result)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            let diagnostic = StageDiagnostic {
                event: Event::Fatal,
                pass: false,
                reason: Some(message.clone()),
                details: json!({ "error": message }),
                extra: BTreeMap::new(),
            };
            let written = serde_json::to_vec_pretty(&diagnostic)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| write_atomic(&path, &bytes).map_err(anyhow::Error::from));
            if let Err(write_err) = written {
                warn!(path = %path.display(), error = %write_err, "failed to write diagnostic");
            }
            Err(e)
        }
    }
}
