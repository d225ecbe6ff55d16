//! Advisory static checks.
//!
//! Each check runs a command in the sandbox and hands the captured output to
//! a `VerdictMatcher`, which classifies it from known success and failure
//! markers. Output is judged even when the command exits non-zero; the
//! resulting verdict is text for the model and never stops the run loop.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolOutput, parse_args};
use crate::agent::sandbox::{CapturedOutput, Sandbox};
use crate::errors::{SandboxError, ToolFailure};

pub const CHECK_SEPARATOR: &str = "\n\n----------------------------------------\n\n";

const TYPESCRIPT_COMMAND: &str = "npx tsc --noEmit --pretty false";
const ESLINT_COMMAND: &str = "npm run lint";
const BUILD_COMMAND: &str = "npm run build";
const CLEAN_BUILD_COMMAND: &str = "rm -rf .next && npm run build";

/// Lines of output quoted back in a verdict.
const MAX_REPORTED_LINES: usize = 20;

static TS_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^.*error TS\d+:.*$").unwrap());

static ESLINT_SUMMARY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) problems? \((\d+) errors?, (\d+) warnings?\)").unwrap()
});

static ESLINT_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^.*(?:\d+:\d+\s+[Ee]rror\b|Error: ).*$").unwrap());

static BUILD_FAILURE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^.*(?:Failed to compile|Type error:|Module not found|Build error occurred|SyntaxError|Error: ).*$",
    )
    .unwrap()
});

static BUILD_SUCCESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Compiled successfully|✓ Compiled|Generating static pages").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictStatus {
    Passed,
    Failed,
    Inconclusive,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Inconclusive => "INCONCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub message: String,
}

impl Verdict {
    fn new(status: VerdictStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn render(&self, check: &str) -> String {
        format!("[{}] {}: {}", check, self.status.as_str(), self.message)
    }
}

/// Classifies the output of one kind of check.
pub trait VerdictMatcher: Send + Sync {
    fn judge(&self, stdout: &str, stderr: &str, exit_code: i64) -> Verdict;
}

fn combined(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{}\n{}", stdout, stderr),
        (false, true) => stdout.to_string(),
        _ => stderr.to_string(),
    }
}

fn excerpt(lines: &[&str]) -> String {
    let mut out = lines[..lines.len().min(MAX_REPORTED_LINES)].join("\n");
    let extra = lines.len().saturating_sub(MAX_REPORTED_LINES);
    if extra > 0 {
        out.push_str(&format!("\n... and {} more", extra));
    }
    out
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(MAX_REPORTED_LINES);
    lines[start..].join("\n")
}

/// `tsc` diagnostics. With `only` set, errors outside those files are ignored.
#[derive(Debug, Clone, Default)]
pub struct TypeScriptMatcher {
    only: Vec<String>,
}

impl TypeScriptMatcher {
    pub fn for_files(files: &[String]) -> Self {
        Self {
            only: files
                .iter()
                .map(|f| f.trim_start_matches("./").to_string())
                .collect(),
        }
    }

    fn in_scope(&self, line: &str) -> bool {
        self.only.is_empty()
            || self
                .only
                .iter()
                .any(|f| line.trim_start_matches("./").starts_with(f.as_str()))
    }
}

impl VerdictMatcher for TypeScriptMatcher {
    fn judge(&self, stdout: &str, stderr: &str, exit_code: i64) -> Verdict {
        let output = combined(stdout, stderr);
        let all: Vec<&str> = TS_ERROR_REGEX
            .find_iter(&output)
            .map(|m| m.as_str())
            .collect();
        let errors: Vec<&str> = all.iter().copied().filter(|l| self.in_scope(l)).collect();

        if !errors.is_empty() {
            return Verdict::new(
                VerdictStatus::Failed,
                format!(
                    "Found {} TypeScript error(s):\n{}",
                    errors.len(),
                    excerpt(&errors)
                ),
            );
        }
        if !self.only.is_empty() {
            let message = if all.is_empty() {
                "No TypeScript errors in the given files".to_string()
            } else {
                format!(
                    "No TypeScript errors in the given files ({} error(s) elsewhere)",
                    all.len()
                )
            };
            return Verdict::new(VerdictStatus::Passed, message);
        }
        if exit_code == 0 {
            return Verdict::new(VerdictStatus::Passed, "No TypeScript errors");
        }
        Verdict::new(
            VerdictStatus::Inconclusive,
            format!("tsc exited with code {}:\n{}", exit_code, tail(&output)),
        )
    }
}

/// ESLint / `next lint` output.
#[derive(Debug, Clone, Default)]
pub struct EslintMatcher;

impl VerdictMatcher for EslintMatcher {
    fn judge(&self, stdout: &str, stderr: &str, exit_code: i64) -> Verdict {
        let output = combined(stdout, stderr);
        if output.contains("No ESLint warnings or errors") {
            return Verdict::new(VerdictStatus::Passed, "No ESLint warnings or errors");
        }
        let error_lines: Vec<&str> = ESLINT_ERROR_REGEX
            .find_iter(&output)
            .map(|m| m.as_str())
            .collect();

        if let Some(caps) = ESLINT_SUMMARY_REGEX.captures(&output) {
            let errors: usize = caps[2].parse().unwrap_or(0);
            let warnings: usize = caps[3].parse().unwrap_or(0);
            if errors == 0 {
                return Verdict::new(
                    VerdictStatus::Passed,
                    format!("No lint errors ({} warning(s))", warnings),
                );
            }
            return Verdict::new(
                VerdictStatus::Failed,
                format!(
                    "{} error(s), {} warning(s):\n{}",
                    errors,
                    warnings,
                    excerpt(&error_lines)
                ),
            );
        }
        if !error_lines.is_empty() {
            return Verdict::new(
                VerdictStatus::Failed,
                format!("Lint errors:\n{}", excerpt(&error_lines)),
            );
        }
        if exit_code == 0 {
            return Verdict::new(VerdictStatus::Passed, "No lint errors");
        }
        Verdict::new(
            VerdictStatus::Inconclusive,
            format!("lint exited with code {}:\n{}", exit_code, tail(&output)),
        )
    }
}

/// `next build` output.
#[derive(Debug, Clone, Default)]
pub struct BuildMatcher;

impl VerdictMatcher for BuildMatcher {
    fn judge(&self, stdout: &str, stderr: &str, exit_code: i64) -> Verdict {
        let output = combined(stdout, stderr);
        let failures: Vec<&str> = BUILD_FAILURE_REGEX
            .find_iter(&output)
            .map(|m| m.as_str())
            .collect();

        if exit_code != 0 && !failures.is_empty() {
            return Verdict::new(
                VerdictStatus::Failed,
                format!("Build failed:\n{}", excerpt(&failures)),
            );
        }
        if exit_code == 0 {
            let message = if BUILD_SUCCESS_REGEX.is_match(&output) {
                "Build compiled successfully"
            } else {
                "Build finished"
            };
            return Verdict::new(VerdictStatus::Passed, message);
        }
        Verdict::new(
            VerdictStatus::Inconclusive,
            format!("build exited with code {}:\n{}", exit_code, tail(&output)),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Typescript,
    Eslint,
    Build,
}

impl CheckKind {
    pub const ALL: [CheckKind; 3] = [Self::Typescript, Self::Eslint, Self::Build];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Typescript => "typescript",
            Self::Eslint => "eslint",
            Self::Build => "build",
        }
    }

    fn command(&self) -> &'static str {
        match self {
            Self::Typescript => TYPESCRIPT_COMMAND,
            Self::Eslint => ESLINT_COMMAND,
            Self::Build => BUILD_COMMAND,
        }
    }

    fn matcher(&self) -> Box<dyn VerdictMatcher> {
        match self {
            Self::Typescript => Box::new(TypeScriptMatcher::default()),
            Self::Eslint => Box::new(EslintMatcher),
            Self::Build => Box::new(BuildMatcher),
        }
    }
}

/// Run `command` and judge its output. Only failures to run the command at
/// all are errors.
async fn run_check(
    sandbox: &dyn Sandbox,
    check: &str,
    command: &str,
    matcher: &dyn VerdictMatcher,
) -> Result<String, ToolFailure> {
    let mut capture = CapturedOutput::default();
    let (stdout, stderr, exit_code) = match sandbox.run_command(command, &mut capture).await {
        Ok(out) => (out.stdout, out.stderr, out.exit_code),
        Err(SandboxError::CommandExit {
            exit_code,
            stdout,
            stderr,
        }) => (stdout, stderr, exit_code),
        Err(source) => {
            return Err(ToolFailure::Check {
                check: check.to_string(),
                source,
            });
        }
    };
    Ok(matcher.judge(&stdout, &stderr, exit_code).render(check))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CheckType {
    Typescript,
    Eslint,
    Build,
    All,
}

#[derive(Debug, Deserialize)]
struct RunChecksArgs {
    #[serde(rename = "checkType")]
    check_type: CheckType,
}

#[derive(Debug, Deserialize)]
struct CheckSyntaxArgs {
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BuildProjectArgs {
    #[serde(rename = "skipCache", default)]
    skip_cache: bool,
}

/// Type check, lint, build, or all three.
pub struct RunChecks;

#[async_trait]
impl Tool for RunChecks {
    fn name(&self) -> &'static str {
        "runChecks"
    }

    fn description(&self) -> &'static str {
        "Run TypeScript, ESLint or build checks on the project and report the verdict"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "checkType": {
                    "type": "string",
                    "enum": ["typescript", "eslint", "build", "all"]
                }
            },
            "required": ["checkType"]
        })
    }

    async fn call(&self, sandbox: &dyn Sandbox, args: Value) -> Result<ToolOutput, ToolFailure> {
        let args: RunChecksArgs = parse_args(self.name(), args)?;
        let kind = match args.check_type {
            CheckType::Typescript => CheckKind::Typescript,
            CheckType::Eslint => CheckKind::Eslint,
            CheckType::Build => CheckKind::Build,
            CheckType::All => {
                let mut sections = Vec::with_capacity(CheckKind::ALL.len());
                for kind in CheckKind::ALL {
                    let matcher = kind.matcher();
                    let section =
                        match run_check(sandbox, kind.as_str(), kind.command(), matcher.as_ref())
                            .await
                        {
                            Ok(text) => text,
                            Err(failure) => failure.to_string(),
                        };
                    sections.push(section);
                }
                return Ok(ToolOutput::text(sections.join(CHECK_SEPARATOR)));
            }
        };
        let matcher = kind.matcher();
        let text = run_check(sandbox, kind.as_str(), kind.command(), matcher.as_ref()).await?;
        Ok(ToolOutput::text(text))
    }
}

/// Type check restricted to the given files.
pub struct CheckSyntax;

#[async_trait]
impl Tool for CheckSyntax {
    fn name(&self) -> &'static str {
        "checkSyntax"
    }

    fn description(&self) -> &'static str {
        "Check specific files for syntax and type errors"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["files"]
        })
    }

    async fn call(&self, sandbox: &dyn Sandbox, args: Value) -> Result<ToolOutput, ToolFailure> {
        let args: CheckSyntaxArgs = parse_args(self.name(), args)?;
        if args.files.is_empty() {
            return Err(ToolFailure::InvalidArguments {
                tool: self.name().to_string(),
                message: "files must not be empty".to_string(),
            });
        }
        let matcher = TypeScriptMatcher::for_files(&args.files);
        let text = run_check(sandbox, "syntax", TYPESCRIPT_COMMAND, &matcher).await?;
        Ok(ToolOutput::text(text))
    }
}

/// Production build, optionally from a clean cache.
pub struct BuildProject;

#[async_trait]
impl Tool for BuildProject {
    fn name(&self) -> &'static str {
        "buildProject"
    }

    fn description(&self) -> &'static str {
        "Run a production build of the project"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skipCache": {"type": "boolean", "description": "Delete the build cache first"}
            }
        })
    }

    async fn call(&self, sandbox: &dyn Sandbox, args: Value) -> Result<ToolOutput, ToolFailure> {
        let args: BuildProjectArgs = parse_args(self.name(), args)?;
        let command = if args.skip_cache {
            CLEAN_BUILD_COMMAND
        } else {
            BUILD_COMMAND
        };
        let text = run_check(sandbox, "build", command, &BuildMatcher).await?;
        Ok(ToolOutput::text(text))
    }
}
