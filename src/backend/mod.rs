//! Generation backend collaborator.
//!
//! A backend turns a rendered prompt into free text. The engine never looks
//! inside the model; it only needs the text back (also written to
//! `output_path`) or a typed [`PipelineError`].

pub mod claude;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::PipelineError;

pub use claude::ClaudeCliBackend;

/// Which provider and model to run a prompt against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelector {
    pub provider: String,
    pub model: String,
}

impl ModelSelector {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub selector: ModelSelector,
    /// Where the backend writes the final text.
    pub output_path: PathBuf,
    /// Directory the backend runs in (the working copy).
    pub cwd: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub output_path: PathBuf,
    pub duration: Duration,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
    -> Result<GenerationOutput, PipelineError>;
}
