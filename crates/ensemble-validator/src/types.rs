use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeIssue {
    pub severity: IssueSeverity,
    /// Rule code, e.g. E501 or SYNTAX.
    pub code: String,
    pub message: String,
    pub line: usize,
    pub column: usize,
    #[serde(default)]
    pub fixable: bool,
}

impl CodeIssue {
    pub fn new(
        severity: IssueSeverity,
        code: impl Into<String>,
        message: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            line,
            column,
            fixable: false,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, line: usize) -> Self {
        Self::new(IssueSeverity::Error, code, message, line, 0)
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>, line: usize) -> Self {
        Self::new(IssueSeverity::Warning, code, message, line, 0)
    }

    pub fn info(code: impl Into<String>, message: impl Into<String>, line: usize) -> Self {
        Self::new(IssueSeverity::Info, code, message, line, 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub issues: Vec<CodeIssue>,
    #[serde(default)]
    pub fixed_code: Option<String>,
    pub language: String,
    pub errors_count: usize,
    pub warnings_count: usize,
}

impl ValidationResult {
    pub fn valid(language: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            issues: Vec::new(),
            fixed_code: None,
            language: language.into(),
            errors_count: 0,
            warnings_count: 0,
        }
    }

    pub fn from_issues(language: impl Into<String>, issues: Vec<CodeIssue>) -> Self {
        let errors_count = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .count();
        let warnings_count = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .count();
        Self {
            is_valid: errors_count == 0,
            issues,
            fixed_code: None,
            language: language.into(),
            errors_count,
            warnings_count,
        }
    }

    pub fn with_fixed_code(mut self, fixed_code: impl Into<String>) -> Self {
        self.fixed_code = Some(fixed_code.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_follow_issue_severities() {
        let result = ValidationResult::from_issues(
            "python",
            vec![
                CodeIssue::error("SYNTAX", "bad", 1),
                CodeIssue::warning("LINE_LENGTH", "long", 2),
                CodeIssue::info("PRINT", "print call", 3),
            ],
        );
        assert!(!result.is_valid);
        assert_eq!(result.errors_count, 1);
        assert_eq!(result.warnings_count, 1);
    }

    #[test]
    fn warnings_alone_keep_code_valid() {
        let result = ValidationResult::from_issues(
            "javascript",
            vec![CodeIssue::warning("VAR_USAGE", "use let", 1)],
        );
        assert!(result.is_valid);
    }
}
