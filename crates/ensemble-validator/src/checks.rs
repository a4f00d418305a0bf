//! Built-in checks used when no external linter is installed

use regex::Regex;

use crate::types::{CodeIssue, IssueSeverity};

/// String-aware bracket balance check shared by both languages.
pub fn check_brackets(code: &str) -> Option<String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut in_string = false;
    let mut string_char = ' ';
    let mut escape_next = false;

    for (i, ch) in code.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' => escape_next = true,
            '\'' | '"' | '`' => {
                if !in_string {
                    in_string = true;
                    string_char = ch;
                } else if ch == string_char {
                    in_string = false;
                }
            }
            _ if in_string => {}
            '(' | '{' | '[' => stack.push((ch, i)),
            ')' | '}' | ']' => {
                let expected = match ch {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                match stack.pop() {
                    None => return Some(format!("unexpected closing bracket '{}' at position {}", ch, i)),
                    Some((open, _)) if open != expected => {
                        return Some(format!(
                            "mismatched brackets: '{}' closed by '{}'",
                            open, ch
                        ));
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }
    }

    stack
        .last()
        .map(|(open, pos)| format!("unclosed bracket '{}' at position {}", open, pos))
}

/// Heuristic Python syntax checks: bracket balance plus block headers that
/// are missing their trailing colon.
pub fn python_syntax_issues(code: &str) -> Vec<CodeIssue> {
    let mut issues = Vec::new();

    if let Some(message) = check_brackets(code) {
        issues.push(CodeIssue::error("SYNTAX", message, 1));
    }

    let block_header = match Regex::new(
        r"^\s*(async\s+def|def|class|if|elif|else|for|while|try|except|finally|with)\b",
    ) {
        Ok(re) => re,
        Err(_) => return issues,
    };

    for (i, line) in code.lines().enumerate() {
        let stripped = strip_comment(line).trim_end();
        if stripped.is_empty() || !block_header.is_match(stripped) {
            continue;
        }
        // Multi-line headers (open brackets, explicit continuations) are
        // closed on a later line.
        if stripped.ends_with(':') || stripped.ends_with('\\') {
            continue;
        }
        if check_brackets(stripped).is_some() {
            continue;
        }
        // Single-word expressions like a variable named `classify` do not
        // match the word boundary, so this is a real block header.
        issues.push(CodeIssue::error(
            "SYNTAX",
            format!("line {}: missing ':' after block header", i + 1),
            i + 1,
        ));
    }

    issues
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut string_char = ' ';
    for (i, ch) in line.char_indices() {
        match ch {
            '\'' | '"' => {
                if !in_string {
                    in_string = true;
                    string_char = ch;
                } else if ch == string_char {
                    in_string = false;
                }
            }
            '#' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Style notices for generated Python.
pub fn python_quality_issues(code: &str) -> Vec<CodeIssue> {
    let mut issues = Vec::new();
    let print_call = Regex::new(r"^\s*print\s*\(").ok();

    for (i, line) in code.lines().enumerate() {
        let lineno = i + 1;
        if print_call.as_ref().is_some_and(|re| re.is_match(line)) {
            issues.push(CodeIssue::info(
                "PRINT",
                "consider using logging instead of print()",
                lineno,
            ));
        }
        if line.contains("TODO") || line.contains("FIXME") {
            issues.push(CodeIssue::info("TODO", "found TODO/FIXME comment", lineno));
        }
        if line.len() > 120 {
            issues.push(CodeIssue::warning(
                "LINE_LENGTH",
                format!("line too long ({} > 120 characters)", line.len()),
                lineno,
            ));
        }
    }
    issues
}

/// Quality rules for generated JavaScript/TypeScript.
pub fn javascript_quality_issues(code: &str) -> Vec<CodeIssue> {
    let mut issues = Vec::new();
    let var_decl = Regex::new(r"\bvar\s+").ok();
    let loose_eq = Regex::new(r"[^=!<>]==[^=]").ok();

    for (i, line) in code.lines().enumerate() {
        let lineno = i + 1;
        if line.contains("console.") {
            issues.push(CodeIssue::info(
                "CONSOLE",
                "consider removing console statements",
                lineno,
            ));
        }
        if var_decl.as_ref().is_some_and(|re| re.is_match(line)) {
            issues.push(CodeIssue::warning(
                "VAR_USAGE",
                "use const or let instead of var",
                lineno,
            ));
        }
        if loose_eq.as_ref().is_some_and(|re| re.is_match(line)) {
            issues.push(CodeIssue::warning(
                "LOOSE_EQUALITY",
                "use === instead of ==",
                lineno,
            ));
        }
    }
    issues
}
