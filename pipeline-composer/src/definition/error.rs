// Definition error types
// YAML problems with line/column, source context and fix suggestions

use crate::error::BuildError;

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Detailed parse error with location and context
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    /// Line number (1-indexed)
    pub line: usize,
    /// Column number (1-indexed)
    pub column: usize,
    /// A few source lines around the error, with a marker on the failing one
    pub context: String,
    pub suggestion: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Fill `context` from the source document
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let marker = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));

            if line_num == self.line && self.column > 0 {
                context.push_str(&format!("       | {}^\n", " ".repeat(self.column - 1)));
            }
        }

        self.context = context;
        self
    }

    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        let mut error = ParseError::new(readable_message(&err.to_string()), line, column)
            .with_source_context(source, 2);
        error.suggestion = suggest_fix(&err.to_string(), source, line);
        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        writeln!(f, "  --> line {}:{}", self.line, self.column)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

fn readable_message(msg: &str) -> String {
    // serde_yaml appends " at line X column Y"; the location is shown separately
    let msg = match msg.find(" at line ") {
        Some(at) => &msg[..at],
        None => msg,
    };

    // Keep a leading document path such as "stages[0]"
    match msg.split_once(": ") {
        Some((path, rest)) if !path.contains(' ') => format!("{}: {}", path, readable_detail(rest)),
        _ => readable_detail(msg),
    }
}

fn readable_detail(msg: &str) -> String {
    if let Some(field) = between(msg, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }

    if let Some(field) = between(msg, "unknown field `", "`") {
        return match msg.split_once("expected one of ") {
            Some((_, expected)) => format!(
                "unknown field '{}', expected one of: {}",
                field,
                expected.replace('`', "")
            ),
            None => format!("unknown field '{}'", field),
        };
    }

    msg.to_string()
}

fn between<'a>(msg: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(&msg[start..end])
}

fn suggest_fix(msg: &str, source: &str, line: usize) -> Option<String> {
    let error_line = source.lines().nth(line.saturating_sub(1)).unwrap_or("");

    if msg.contains("missing field `component`") {
        return Some("every stage needs a 'component:' naming the component it runs".to_string());
    }

    if error_line.starts_with('\t') {
        return Some("YAML indentation must use spaces, not tabs".to_string());
    }

    let typos = [
        ("depends_on", "after"),
        ("dependson", "after"),
        ("dependsOn", "after"),
        ("args:", "arguments"),
        ("params:", "arguments"),
        ("basepath", "base_path"),
        ("resource:", "resources"),
    ];
    for (typo, correct) in typos {
        if error_line.contains(typo) || error_line.to_lowercase().contains(typo) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }

    None
}

/// Errors resolving or loading a component definition
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("component '{reference}' not found (searched: {})", display_paths(.searched))]
    NotFound {
        reference: String,
        searched: Vec<PathBuf>,
    },

    #[error("invalid component file '{}':\n{source}", .path.display())]
    Parse { path: PathBuf, source: ParseError },

    #[error("component '{0}' must declare exactly one of 'image' or 'callable'")]
    InvalidExecutable(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no search directories".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A problem with one stage entry of a pipeline definition
#[derive(Debug, Error)]
pub enum StageEntryError {
    #[error("stage '{stage}': {source}")]
    Component {
        stage: String,
        source: ComponentError,
    },

    #[error("stage '{stage}': {source}")]
    Build { stage: String, source: BuildError },
}

impl StageEntryError {
    pub fn stage(&self) -> &str {
        match self {
            StageEntryError::Component { stage, .. } | StageEntryError::Build { stage, .. } => stage,
        }
    }
}

/// Errors loading a pipeline definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("failed to read '{}': {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("{} stage definition error(s):\n{}", .0.len(), display_entries(.0))]
    Stages(Vec<StageEntryError>),
}

fn display_entries(errors: &[StageEntryError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("missing required field 'component'", 4, 5)
            .with_suggestion("every stage needs a 'component:'");

        let output = err.to_string();
        assert!(output.contains("missing required field"));
        assert!(output.contains("line 4:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_source_context_marks_line() {
        let source = "name: p\nstages:\n  - name: a\n    component: x\n";
        let err = ParseError::new("boom", 3, 5).with_source_context(source, 1);

        assert!(err.context.contains(">    3 |   - name: a"));
        assert!(err.context.contains("stages:"));
        assert!(err.context.contains("    ^"));
    }

    #[test]
    fn test_readable_unknown_field() {
        let msg = "stages[0]: unknown field `depends_on`, expected one of `name`, `component` at line 4 column 5";
        assert_eq!(
            readable_message(msg),
            "stages[0]: unknown field 'depends_on', expected one of: name, component"
        );
    }

    #[test]
    fn test_typo_suggestion() {
        let source = "stages:\n  - component: a\n    depends_on: b\n";
        assert_eq!(
            suggest_fix("unknown field `depends_on`", source, 3),
            Some("did you mean 'after'?".to_string())
        );
    }

    #[test]
    fn test_not_found_lists_searched_paths() {
        let err = ComponentError::NotFound {
            reference: "caption_images".to_string(),
            searched: vec![PathBuf::from("/c/caption_images/component.yaml")],
        };
        assert!(err
            .to_string()
            .contains("/c/caption_images/component.yaml"));
    }
}
