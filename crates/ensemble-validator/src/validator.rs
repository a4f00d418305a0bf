//! The validator itself: detection, linting, repair

use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use ensemble_core::{ChatMessage, GenerationConfig};
use ensemble_llm::{GenerateRequest, LlmGateway};

use crate::checks::{
    check_brackets, javascript_quality_issues, python_quality_issues, python_syntax_issues,
};
use crate::extract::extract_code;
use crate::types::{CodeIssue, IssueSeverity, ValidationResult};

const LINTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Ruff rule groups checked on generated Python.
const RUFF_SELECT: &str = "E,F,W,B,I,N,UP,S,C4,SIM";
/// Rules that make no sense for LLM output (long lines, late imports,
/// unused imports, asserts).
const RUFF_IGNORE: &str = "E501,E402,F401,S101";

pub struct CodeValidator {
    gateway: Option<Arc<LlmGateway>>,
    auto_fix: bool,
    max_fix_attempts: u32,
    ruff_available: bool,
    eslint_available: bool,
}

impl CodeValidator {
    pub fn new(gateway: Option<Arc<LlmGateway>>) -> Self {
        let ruff_available = probe_tool("ruff");
        let eslint_available = probe_tool("eslint");
        if ruff_available {
            info!("ruff available for Python validation");
        } else {
            info!("ruff not found, using built-in Python checks");
        }
        Self {
            gateway,
            auto_fix: true,
            max_fix_attempts: 2,
            ruff_available,
            eslint_available,
        }
    }

    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix = auto_fix;
        self
    }

    pub fn with_max_fix_attempts(mut self, attempts: u32) -> Self {
        self.max_fix_attempts = attempts;
        self
    }

    /// Force the external-tool availability flags; tests use this to pin
    /// the built-in fallback path.
    pub fn with_tools(mut self, ruff: bool, eslint: bool) -> Self {
        self.ruff_available = ruff;
        self.eslint_available = eslint;
        self
    }

    pub async fn validate(
        &self,
        code: &str,
        language: Option<&str>,
        fix_errors: bool,
        task_context: Option<&str>,
    ) -> ValidationResult {
        if code.trim().is_empty() {
            return ValidationResult::valid(language.unwrap_or("unknown"));
        }

        let language = language
            .map(str::to_string)
            .unwrap_or_else(|| detect_language(code).to_string());

        match language.as_str() {
            "python" => self.validate_python(code, fix_errors, task_context).await,
            "javascript" | "typescript" => {
                self.validate_javascript(code, &language, fix_errors, task_context)
                    .await
            }
            other => ValidationResult::from_issues(
                other,
                vec![CodeIssue::info(
                    "UNSUPPORTED",
                    format!("validation for {} is not fully supported", other),
                    1,
                )],
            ),
        }
    }

    async fn validate_python(
        &self,
        code: &str,
        fix_errors: bool,
        task_context: Option<&str>,
    ) -> ValidationResult {
        let mut current = code.to_string();
        let mut repaired = false;

        // Syntax stage. Repair attempts are bounded; each one revalidates.
        let mut attempts = 0;
        loop {
            let syntax_issues = python_syntax_issues(&current);
            if syntax_issues.is_empty() {
                break;
            }
            if !fix_errors || attempts >= self.max_fix_attempts {
                let result = ValidationResult::from_issues("python", syntax_issues);
                return if repaired {
                    result.with_fixed_code(current)
                } else {
                    result
                };
            }
            match self
                .fix_with_llm(&current, &syntax_issues, "python", task_context)
                .await
            {
                Some(fixed) => {
                    attempts += 1;
                    repaired = true;
                    current = fixed;
                }
                None => {
                    let result = ValidationResult::from_issues("python", syntax_issues);
                    return if repaired {
                        result.with_fixed_code(current)
                    } else {
                        result
                    };
                }
            }
        }

        // Lint stage.
        let mut issues = if self.ruff_available {
            self.run_ruff(&current).await
        } else {
            Vec::new()
        };
        issues.extend(python_quality_issues(&current));

        let errors = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .count();

        if errors > 0 && fix_errors && self.auto_fix {
            // Safe linter fixes first.
            if self.ruff_available {
                if let Some(fixed) = self.run_ruff_fix(&current).await {
                    if fixed != current {
                        let mut lint_issues = self.run_ruff(&fixed).await;
                        lint_issues.extend(python_quality_issues(&fixed));
                        let mut result = ValidationResult::from_issues("python", lint_issues);
                        result.fixed_code = Some(fixed);
                        if result.is_valid {
                            return result;
                        }
                        current = result.fixed_code.clone().unwrap_or(current);
                        issues = result.issues;
                    }
                }
            }

            // Escalate to the LLM for what the linter could not fix.
            let top_issues: Vec<CodeIssue> = issues
                .iter()
                .filter(|i| i.severity == IssueSeverity::Error)
                .take(5)
                .cloned()
                .collect();
            if let Some(fixed) = self
                .fix_with_llm(&current, &top_issues, "python", task_context)
                .await
            {
                let mut lint_issues = if self.ruff_available {
                    self.run_ruff(&fixed).await
                } else {
                    Vec::new()
                };
                lint_issues.extend(python_syntax_issues(&fixed));
                lint_issues.extend(python_quality_issues(&fixed));
                let result = ValidationResult::from_issues("python", lint_issues);
                return result.with_fixed_code(fixed);
            }
        }

        let result = ValidationResult::from_issues("python", issues);
        if repaired {
            result.with_fixed_code(current)
        } else {
            result
        }
    }

    async fn validate_javascript(
        &self,
        code: &str,
        language: &str,
        fix_errors: bool,
        task_context: Option<&str>,
    ) -> ValidationResult {
        if let Some(message) = check_brackets(code) {
            let issues = vec![CodeIssue::error("BRACKETS", message, 1)];
            if fix_errors {
                if let Some(fixed) = self
                    .fix_with_llm(code, &issues, language, task_context)
                    .await
                {
                    if check_brackets(&fixed).is_none() {
                        let mut result = ValidationResult::from_issues(
                            language,
                            javascript_quality_issues(&fixed),
                        );
                        result.fixed_code = Some(fixed);
                        return result;
                    }
                }
            }
            return ValidationResult::from_issues(language, issues);
        }

        let mut issues = javascript_quality_issues(code);
        if self.eslint_available {
            issues.extend(self.run_eslint(code).await);
        }
        ValidationResult::from_issues(language, issues)
    }

    async fn run_ruff(&self, code: &str) -> Vec<CodeIssue> {
        let Some(file) = write_scratch(code, ".py") else {
            return Vec::new();
        };

        let output = tokio::time::timeout(
            LINTER_TIMEOUT,
            tokio::process::Command::new("ruff")
                .arg("check")
                .arg(format!("--select={}", RUFF_SELECT))
                .arg(format!("--ignore={}", RUFF_IGNORE))
                .arg("--output-format=json")
                .arg(file.path())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output(),
        )
        .await;

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(error = %err, "ruff failed to run");
                return Vec::new();
            }
            Err(_) => {
                warn!("ruff timed out");
                return Vec::new();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&stdout) else {
            debug!("unparseable ruff output");
            return Vec::new();
        };

        items
            .iter()
            .map(|item| {
                let rule = item["code"].as_str().unwrap_or("").to_string();
                let severity = if rule.starts_with('E')
                    || rule.starts_with('F')
                    || rule.starts_with('S')
                    || rule.starts_with('B')
                {
                    IssueSeverity::Error
                } else {
                    IssueSeverity::Warning
                };
                CodeIssue {
                    severity,
                    code: rule,
                    message: item["message"].as_str().unwrap_or("unknown issue").into(),
                    line: item["location"]["row"].as_u64().unwrap_or(1) as usize,
                    column: item["location"]["column"].as_u64().unwrap_or(0) as usize,
                    fixable: item["fix"]["applicability"].as_str() == Some("safe"),
                }
            })
            .collect()
    }

    async fn run_ruff_fix(&self, code: &str) -> Option<String> {
        let file = write_scratch(code, ".py")?;

        let run = tokio::time::timeout(
            LINTER_TIMEOUT,
            tokio::process::Command::new("ruff")
                .arg("check")
                .arg("--fix")
                .arg("--unsafe-fixes")
                .arg(file.path())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await;

        match run {
            Ok(Ok(_)) => tokio::fs::read_to_string(file.path()).await.ok(),
            _ => None,
        }
    }

    async fn run_eslint(&self, code: &str) -> Vec<CodeIssue> {
        let Some(file) = write_scratch(code, ".js") else {
            return Vec::new();
        };

        let output = tokio::time::timeout(
            LINTER_TIMEOUT,
            tokio::process::Command::new("eslint")
                .arg("--format=json")
                .arg("--no-eslintrc")
                .arg(file.path())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output(),
        )
        .await;

        let Ok(Ok(output)) = output else {
            return Vec::new();
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Ok(Value::Array(files)) = serde_json::from_str::<Value>(&stdout) else {
            return Vec::new();
        };

        files
            .iter()
            .flat_map(|f| f["messages"].as_array().cloned().unwrap_or_default())
            .map(|m| CodeIssue {
                severity: if m["severity"].as_u64() == Some(2) {
                    IssueSeverity::Error
                } else {
                    IssueSeverity::Warning
                },
                code: m["ruleId"].as_str().unwrap_or("eslint").into(),
                message: m["message"].as_str().unwrap_or("").into(),
                line: m["line"].as_u64().unwrap_or(1) as usize,
                column: m["column"].as_u64().unwrap_or(0) as usize,
                fixable: false,
            })
            .collect()
    }

    /// One bounded repair attempt: temperature 0.1, output budget twice
    /// the original's estimated tokens.
    async fn fix_with_llm(
        &self,
        code: &str,
        issues: &[CodeIssue],
        language: &str,
        task_context: Option<&str>,
    ) -> Option<String> {
        let gateway = self.gateway.as_ref()?;

        let issues_text = issues
            .iter()
            .map(|i| format!("- Line {}: [{}] {}", i.line, i.code, i.message))
            .collect::<Vec<_>>()
            .join("\n");
        let context_note = task_context
            .map(|t| format!("\nORIGINAL TASK: {}", t.chars().take(200).collect::<String>()))
            .unwrap_or_default();

        let prompt = format!(
            "Fix the following {language} code errors.\n\nERRORS:\n{issues_text}\n\n\
             CODE:\n```{language}\n{code}\n```\n{context_note}\n\
             IMPORTANT:\n- Fix ONLY the errors listed above\n- Keep the original functionality\n\
             - Return ONLY the fixed code wrapped in a markdown code block\n- Make minimal changes\n\nFixed code:"
        );

        let token_budget = ((code.len() / 4) * 2).max(256) as u32;
        let request = GenerateRequest::new(vec![
            ChatMessage::system(format!("You are a {} expert. Fix code errors precisely.", language)),
            ChatMessage::user(prompt),
        ])
        .with_config(
            GenerationConfig::default()
                .with_temperature(0.1)
                .with_max_tokens(token_budget),
        );

        match gateway.generate(request).await {
            Ok(response) => {
                let fixed = extract_code(&response.content, Some(language));
                if fixed.trim().is_empty() {
                    None
                } else {
                    Some(fixed)
                }
            }
            Err(err) => {
                warn!(error = %err, "LLM repair failed");
                None
            }
        }
    }
}

fn probe_tool(tool: &str) -> bool {
    std::process::Command::new(tool)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn write_scratch(code: &str, suffix: &str) -> Option<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().ok()?;
    file.write_all(code.as_bytes()).ok()?;
    file.flush().ok()?;
    Some(file)
}

/// Keyword/token scoring between Python and JavaScript; Python wins ties.
pub fn detect_language(code: &str) -> &'static str {
    let patterns = |ps: &[(&str, u32)]| -> u32 {
        ps.iter()
            .map(|(p, w)| {
                Regex::new(p)
                    .map(|re| if re.is_match(code) { *w } else { 0 })
                    .unwrap_or(0)
            })
            .sum()
    };

    let python_score = patterns(&[
        (r"\bdef\s+\w+\s*\(", 2),
        (r"\bimport\s+\w+", 1),
        (r"\bclass\s+\w+.*:", 2),
        (r"\basync\s+def\b", 2),
        (r"\bself\.", 1),
    ]);
    let js_score = patterns(&[
        (r"\bfunction\s+\w+\s*\(", 2),
        (r"\bconst\s+\w+\s*=", 2),
        (r"\blet\s+\w+\s*=", 1),
        (r"=>", 1),
        (r"\bconsole\.", 1),
    ]);

    if js_score > python_score {
        "javascript"
    } else {
        "python"
    }
}
