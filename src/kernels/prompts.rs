//! Prompt rendering for the generating stages.

use std::path::{Path, PathBuf};

use crate::workflow::WorkflowContext;

/// Inputs of an impl prompt that are not in the context.
pub struct ImplPromptInputs<'a> {
    /// Finalize artifact, as the agent should address it.
    pub finalize: &'a Path,
    /// Commit-message artifact for this iteration.
    pub commit_report: &'a Path,
    pub last_commit: Option<&'a str>,
}

pub fn completion_marker(issue: u64) -> String {
    format!("Issue {} resolved", issue)
}

pub fn impl_prompt(ctx: &WorkflowContext, inputs: &ImplPromptInputs<'_>) -> String {
    let state = &ctx.state;
    let mut prompt = format!(
        r#"You are resolving issue #{issue} in this repository.

## ISSUE
{plan}
"#,
        issue = state.issue,
        plan = ctx.plan.trim(),
    );

    if let Some(instruction) = &ctx.upstream_instruction {
        prompt.push_str(&format!("\n## ADDITIONAL INSTRUCTIONS\n{}\n", instruction.trim()));
    }

    if state.iteration > 1 {
        prompt.push_str(&format!(
            "\n## PROGRESS\nThis is iteration {} of at most {}.\n",
            state.iteration, ctx.tunables.max_iterations
        ));
        if let Some(commit) = inputs.last_commit {
            prompt.push_str(&format!("Last commit: {}\n", commit));
        }
        if let Some(output) = &state.last_output {
            prompt.push_str(&format!(
                "Your previous output is saved at {}.\n",
                output.display()
            ));
        }
    }

    let retry = ctx.retry_context().or_else(|| state.last_feedback.clone());
    if let Some(retry) = retry {
        prompt.push_str(&format!(
            "\n## FIX BEFORE ANYTHING ELSE\n{}\n",
            retry.trim()
        ));
    }

    prompt.push_str(&format!(
        r#"
## RULES
1. Make the smallest change that fully resolves the issue
2. Run the relevant tests before declaring completion
3. Do not commit; the workflow commits for you

## WHEN DONE
Write the commit message to `{commit}`.
Write `{finalize}` with the pull request title on the first line in the form
`[tag] summary`, then the pull request body, and a line reading exactly:
{marker}

If you are not done, leave `{finalize}` without that line.
"#,
        commit = inputs.commit_report.display(),
        finalize = inputs.finalize.display(),
        marker = completion_marker(state.issue),
    ));
    prompt
}

/// Inputs of a review prompt that are not in the context.
pub struct ReviewPromptInputs<'a> {
    pub last_commit: Option<&'a str>,
    pub changed_files: &'a [PathBuf],
}

pub fn review_prompt(ctx: &WorkflowContext, inputs: &ReviewPromptInputs<'_>) -> String {
    let files = if inputs.changed_files.is_empty() {
        "(none reported)".to_string()
    } else {
        inputs
            .changed_files
            .iter()
            .map(|p| format!("- {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You are reviewing a change that claims to resolve issue #{issue}.

## ISSUE
{plan}

## CHANGE
Commit: {commit}
Files:
{files}

## TASK
Score the change from 0 to 100 on each dimension:
- faithfulness: does it do what the issue asks, and nothing else
- style: does it match the surrounding code
- docs: are new behaviours documented where the codebase documents them
- corner_cases: are edge cases handled and tested

Reply with a single JSON object:
{{"scores": {{"faithfulness": 0, "style": 0, "docs": 0, "corner_cases": 0}}, "findings": [], "suggestions": []}}
"#,
        issue = ctx.state.issue,
        plan = ctx.plan.trim(),
        commit = inputs.last_commit.unwrap_or("(unknown)"),
        files = files,
    )
}
