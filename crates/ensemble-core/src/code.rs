//! Code entities produced by the project analyzer
//!
//! The analyzer itself lives outside the core; these are the records it
//! emits for indexing into the vector store and for retrieval context.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeEntityKind {
    Function,
    Class,
    Method,
    AsyncFunction,
    AsyncMethod,
    Module,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeEntity {
    pub kind: CodeEntityKind,
    pub name: String,
    /// Dotted path unique within the project, e.g. `pkg.module.Class.method`.
    pub qualified_name: String,
    pub file: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(default)]
    pub docstring: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub complexity: u32,
    #[serde(default)]
    pub decorators: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl CodeEntity {
    pub fn new(
        kind: CodeEntityKind,
        name: impl Into<String>,
        qualified_name: impl Into<String>,
        file: impl Into<String>,
        start_line: usize,
        end_line: usize,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            qualified_name: qualified_name.into(),
            file: file.into(),
            start_line,
            end_line,
            docstring: None,
            signature: None,
            dependencies: Vec::new(),
            imports: Vec::new(),
            complexity: 0,
            decorators: Vec::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    /// The text indexed for this entity: signature and docstring when
    /// present, the qualified name otherwise.
    pub fn index_text(&self) -> String {
        let mut parts = vec![self.qualified_name.clone()];
        if let Some(signature) = &self.signature {
            parts.push(signature.clone());
        }
        if let Some(docstring) = &self.docstring {
            parts.push(docstring.clone());
        }
        parts.join("\n")
    }
}
