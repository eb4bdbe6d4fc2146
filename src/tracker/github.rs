use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use super::{CheckStatus, CreatedItem, IssueDetails, IssueEdit, IssueTracker, PrEdit, PrRequest, PrStatus};
use crate::errors::TrackerError;
use crate::process::{CommandRunner, args};

static ITEM_NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(?:pull|issues)/(\d+)").unwrap());

/// Tracker adapter over the `gh` CLI.
pub struct GhCli {
    worktree: PathBuf,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPr {
    number: u64,
    #[serde(default)]
    url: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    merge_state_status: String,
    #[serde(default)]
    status_check_rollup: Vec<GhCheck>,
}

#[derive(Debug, Deserialize)]
struct GhCheck {
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl GhCli {
    pub fn new(worktree: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            worktree: worktree.into(),
            runner,
            timeout,
        }
    }

    async fn gh(&self, argv: Vec<String>) -> Result<String, TrackerError> {
        let out = self
            .runner
            .run("gh", &argv, &self.worktree, self.timeout)
            .await?;
        if !out.success() {
            return Err(TrackerError::Rejected(out.combined().trim().to_string()));
        }
        Ok(out.stdout)
    }
}

/// Pull the trailing `/pull/N` or `/issues/N` number out of a created URL.
pub fn parse_created_url(stdout: &str) -> Result<CreatedItem, TrackerError> {
    let url = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| l.starts_with("http"))
        .ok_or_else(|| TrackerError::Parse(format!("no URL in output: {}", stdout.trim())))?;
    let number = ITEM_NUMBER_REGEX
        .captures(url)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| TrackerError::Parse(format!("no item number in URL: {}", url)))?;
    Ok(CreatedItem {
        number,
        url: url.to_string(),
    })
}

/// Collapse a check rollup into one status. Any failure wins, then pending.
fn summarize_checks(checks: &[GhCheck]) -> CheckStatus {
    if checks.is_empty() {
        return CheckStatus::None;
    }
    let mut pending = false;
    for check in checks {
        let verdict = check
            .conclusion
            .as_deref()
            .filter(|c| !c.is_empty())
            .or(check.state.as_deref())
            .unwrap_or("")
            .to_ascii_uppercase();
        match verdict.as_str() {
            "FAILURE" | "ERROR" | "CANCELLED" | "TIMED_OUT" | "ACTION_REQUIRED" => {
                return CheckStatus::Failing;
            }
            "SUCCESS" | "NEUTRAL" | "SKIPPED" => {}
            _ => pending = true,
        }
        if check
            .status
            .as_deref()
            .is_some_and(|s| !s.eq_ignore_ascii_case("COMPLETED"))
        {
            pending = true;
        }
    }
    if pending {
        CheckStatus::Pending
    } else {
        CheckStatus::Passing
    }
}

#[async_trait]
impl IssueTracker for GhCli {
    async fn view_issue(&self, number: u64) -> Result<IssueDetails, TrackerError> {
        let stdout = self
            .gh(args(&[
                "issue",
                "view",
                &number.to_string(),
                "--json",
                "number,title,body,state,url,labels",
            ]))
            .await?;
        let issue: GhIssue =
            serde_json::from_str(&stdout).map_err(|e| TrackerError::Parse(e.to_string()))?;
        Ok(IssueDetails {
            number: issue.number,
            title: issue.title,
            body: issue.body,
            state: issue.state,
            url: issue.url,
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
        })
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<CreatedItem, TrackerError> {
        let mut argv = args(&["issue", "create", "--title", title, "--body", body]);
        for label in labels {
            argv.push("--label".to_string());
            argv.push(label.clone());
        }
        let stdout = self.gh(argv).await?;
        parse_created_url(&stdout)
    }

    async fn edit_issue(&self, number: u64, edit: &IssueEdit) -> Result<(), TrackerError> {
        let mut argv = args(&["issue", "edit", &number.to_string()]);
        if let Some(title) = &edit.title {
            argv.extend(args(&["--title", title]));
        }
        if let Some(body) = &edit.body {
            argv.extend(args(&["--body", body]));
        }
        for label in &edit.add_labels {
            argv.extend(args(&["--add-label", label]));
        }
        for label in &edit.remove_labels {
            argv.extend(args(&["--remove-label", label]));
        }
        self.gh(argv).await.map(|_| ())
    }

    async fn create_pr(&self, request: &PrRequest) -> Result<CreatedItem, TrackerError> {
        let stdout = self
            .gh(args(&[
                "pr",
                "create",
                "--title",
                &request.title,
                "--body",
                &request.body,
                "--base",
                &request.base,
                "--head",
                &request.head,
            ]))
            .await?;
        parse_created_url(&stdout)
    }

    async fn view_pr(&self, number: u64) -> Result<PrStatus, TrackerError> {
        let stdout = self
            .gh(args(&[
                "pr",
                "view",
                &number.to_string(),
                "--json",
                "number,url,state,mergeStateStatus,statusCheckRollup",
            ]))
            .await?;
        let pr: GhPr =
            serde_json::from_str(&stdout).map_err(|e| TrackerError::Parse(e.to_string()))?;
        Ok(PrStatus {
            number: pr.number,
            url: pr.url,
            state: pr.state,
            merge_state: pr.merge_state_status,
            checks: summarize_checks(&pr.status_check_rollup),
        })
    }

    async fn edit_pr(&self, number: u64, edit: &PrEdit) -> Result<(), TrackerError> {
        let mut argv = args(&["pr", "edit", &number.to_string()]);
        if let Some(title) = &edit.title {
            argv.extend(args(&["--title", title]));
        }
        if let Some(body) = &edit.body {
            argv.extend(args(&["--body", body]));
        }
        self.gh(argv).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use crate::process::CommandOutput;

    fn gh_with(outputs: Vec<CommandOutput>) -> (GhCli, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new(outputs));
        let gh = GhCli::new("/work", runner.clone(), Duration::from_secs(5));
        (gh, runner)
    }

    #[test]
    fn test_parse_created_url() {
        let item = parse_created_url(
            "Creating pull request for feature into main\n\nhttps://github.com/o/r/pull/123\n",
        )
        .unwrap();
        assert_eq!(item.number, 123);
        assert_eq!(item.url, "https://github.com/o/r/pull/123");

        let issue = parse_created_url("https://github.com/o/r/issues/9").unwrap();
        assert_eq!(issue.number, 9);

        assert!(matches!(
            parse_created_url("nothing useful"),
            Err(TrackerError::Parse(_))
        ));
    }

    #[test]
    fn test_summarize_checks() {
        let check = |conclusion: Option<&str>, status: Option<&str>| GhCheck {
            conclusion: conclusion.map(String::from),
            status: status.map(String::from),
            state: None,
        };
        assert_eq!(summarize_checks(&[]), CheckStatus::None);
        assert_eq!(
            summarize_checks(&[check(Some("SUCCESS"), Some("COMPLETED"))]),
            CheckStatus::Passing
        );
        assert_eq!(
            summarize_checks(&[
                check(Some("SUCCESS"), Some("COMPLETED")),
                check(None, Some("IN_PROGRESS"))
            ]),
            CheckStatus::Pending
        );
        assert_eq!(
            summarize_checks(&[
                check(None, Some("IN_PROGRESS")),
                check(Some("FAILURE"), Some("COMPLETED"))
            ]),
            CheckStatus::Failing
        );
    }

    #[tokio::test]
    async fn test_create_pr_passes_arguments_and_parses_url() {
        let (gh, runner) = gh_with(vec![CommandOutput::ok(
            "https://github.com/o/r/pull/857\n",
        )]);
        let created = gh
            .create_pr(&PrRequest {
                title: "[fix] handle empty input".into(),
                body: "Closes #857".into(),
                base: "main".into(),
                head: "issue-857".into(),
            })
            .await
            .unwrap();
        assert_eq!(created.number, 857);

        let calls = runner.calls();
        assert_eq!(calls[0].0, "gh");
        assert_eq!(&calls[0].1[..2], &["pr".to_string(), "create".to_string()]);
        assert!(calls[0].1.windows(2).any(|w| *w == ["--base", "main"]));
    }

    #[tokio::test]
    async fn test_rejected_call_surfaces_error_text() {
        let (gh, _) = gh_with(vec![CommandOutput::failed(
            1,
            "a pull request for branch \"x\" already exists",
        )]);
        let err = gh
            .create_pr(&PrRequest {
                title: "t".into(),
                body: "b".into(),
                base: "main".into(),
                head: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Rejected(msg) if msg.contains("already exists")));
    }

    #[tokio::test]
    async fn test_view_issue_maps_labels() {
        let (gh, _) = gh_with(vec![CommandOutput::ok(
            r#"{"number":5,"title":"Crash","body":"steps","state":"OPEN","url":"u","labels":[{"name":"bug"}]}"#,
        )]);
        let issue = gh.view_issue(5).await.unwrap();
        assert_eq!(issue.title, "Crash");
        assert_eq!(issue.labels, vec!["bug"]);
    }

    #[tokio::test]
    async fn test_view_pr_summarizes_checks() {
        let (gh, _) = gh_with(vec![CommandOutput::ok(
            r#"{"number":7,"url":"u","state":"OPEN","mergeStateStatus":"CLEAN","statusCheckRollup":[{"conclusion":"SUCCESS","status":"COMPLETED"}]}"#,
        )]);
        let pr = gh.view_pr(7).await.unwrap();
        assert_eq!(pr.merge_state, "CLEAN");
        assert_eq!(pr.checks, CheckStatus::Passing);
    }

    #[tokio::test]
    async fn test_edit_issue_builds_label_flags() {
        let (gh, runner) = gh_with(vec![CommandOutput::ok("")]);
        gh.edit_issue(
            3,
            &IssueEdit {
                add_labels: vec!["in-progress".into()],
                remove_labels: vec!["todo".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let argv = &runner.calls()[0].1;
        assert!(argv.windows(2).any(|w| *w == ["--add-label", "in-progress"]));
        assert!(argv.windows(2).any(|w| *w == ["--remove-label", "todo"]));
    }

    #[tokio::test]
    async fn test_create_issue_passes_labels() {
        let (gh, runner) = gh_with(vec![CommandOutput::ok(
            "https://github.com/o/r/issues/1001\n",
        )]);
        let created = gh
            .create_issue("run failed", "reason", &["issueflow".to_string()])
            .await
            .unwrap();
        assert_eq!(created.number, 1001);
        let argv = &runner.calls()[0].1;
        assert_eq!(&argv[..2], &["issue".to_string(), "create".to_string()]);
        assert!(argv.windows(2).any(|w| *w == ["--label", "issueflow"]));
    }

    #[tokio::test]
    async fn test_edit_pr_sends_only_given_fields() {
        let (gh, runner) = gh_with(vec![CommandOutput::ok("")]);
        gh.edit_pr(
            77,
            &PrEdit {
                title: Some("[fix] x".into()),
                body: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(runner.calls()[0].1, vec!["pr", "edit", "77", "--title", "[fix] x"]);
    }
}
