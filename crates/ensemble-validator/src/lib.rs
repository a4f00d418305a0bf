//! Code validation: syntax checks, linter-backed analysis, automated repair

mod checks;
mod extract;
mod types;
mod validator;

pub use extract::{extract_code, wrap_in_fence};
pub use types::{CodeIssue, IssueSeverity, ValidationResult};
pub use validator::{CodeValidator, detect_language};
