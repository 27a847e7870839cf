// File: src/errors.rs
//
// Error handling and reporting for the Pyle programming language.
// Provides structured error types with source location information
// and pretty-printed error messages.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column, file: None }
    }

    pub fn with_file(line: usize, column: usize, file: String) -> Self {
        Self { line, column, file: Some(file) }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0, file: None }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:{}:{}", file, self.line, self.column)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// The specific failure within a runtime error, so callers can match on
/// failure class without sniffing the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    TypeMismatch,
    Arity,
    UndefinedVariable,
    UndefinedGlobal,
    DivisionByZero,
    IndexOutOfBounds,
    UnhashableKey,
    MissingAttribute,
    UnpackMismatch,
    UnwrapOfError,
    UnknownOpcode,
    StackUnderflow,
    ConstAssignment,
    NotCallable,
    NotIterable,
    ModuleNotFound,
    StackOverflow,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RuntimeErrorKind::TypeMismatch => "type mismatch",
            RuntimeErrorKind::Arity => "arity mismatch",
            RuntimeErrorKind::UndefinedVariable => "undefined variable",
            RuntimeErrorKind::UndefinedGlobal => "undefined global",
            RuntimeErrorKind::DivisionByZero => "division by zero",
            RuntimeErrorKind::IndexOutOfBounds => "index out of bounds",
            RuntimeErrorKind::UnhashableKey => "unhashable key",
            RuntimeErrorKind::MissingAttribute => "missing attribute",
            RuntimeErrorKind::UnpackMismatch => "unpack arity mismatch",
            RuntimeErrorKind::UnwrapOfError => "unwrap of error result",
            RuntimeErrorKind::UnknownOpcode => "unknown opcode",
            RuntimeErrorKind::StackUnderflow => "stack underflow",
            RuntimeErrorKind::ConstAssignment => "assignment to const",
            RuntimeErrorKind::NotCallable => "value not callable",
            RuntimeErrorKind::NotIterable => "value not iterable",
            RuntimeErrorKind::ModuleNotFound => "module not found",
            RuntimeErrorKind::StackOverflow => "stack overflow",
        };
        write!(f, "{}", s)
    }
}

/// Top-level error taxonomy: lexical, syntactic, or runtime (spec §7).
#[derive(Debug, Clone)]
pub enum PyleError {
    Lexical { message: String, location: SourceLocation },
    Syntactic { message: String, location: SourceLocation },
    Runtime { kind: RuntimeErrorKind, message: String, location: SourceLocation },
}

impl PyleError {
    pub fn lexical(message: impl Into<String>, location: SourceLocation) -> Self {
        PyleError::Lexical { message: message.into(), location }
    }

    pub fn syntactic(message: impl Into<String>, location: SourceLocation) -> Self {
        PyleError::Syntactic { message: message.into(), location }
    }

    pub fn runtime(
        kind: RuntimeErrorKind,
        message: impl Into<String>,
        location: SourceLocation,
    ) -> Self {
        PyleError::Runtime { kind, message: message.into(), location }
    }

    pub fn location(&self) -> &SourceLocation {
        match self {
            PyleError::Lexical { location, .. }
            | PyleError::Syntactic { location, .. }
            | PyleError::Runtime { location, .. } => location,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PyleError::Lexical { message, .. }
            | PyleError::Syntactic { message, .. }
            | PyleError::Runtime { message, .. } => message,
        }
    }

    fn kind_label(&self) -> &'static str {
        match self {
            PyleError::Lexical { .. } => "Lexical",
            PyleError::Syntactic { .. } => "Syntactic",
            PyleError::Runtime { .. } => "Runtime",
        }
    }

    /// Renders the `Kind: message at file:line:col` line plus a caret
    /// underline beneath `source_line`, matching the driver contract in
    /// spec §7.
    pub fn render_with_source(&self, source_line: Option<&str>) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{}: {} at {}\n",
            self.kind_label().red().bold(),
            self.message().bold(),
            self.location()
        ));
        if let Some(line) = source_line {
            let col = self.location().column;
            out.push_str(&format!("   {}\n", "|".bright_blue()));
            out.push_str(&format!(
                "{} {} {}\n",
                format!("{:>3}", self.location().line).bright_blue(),
                "|".bright_blue(),
                line
            ));
            out.push_str(&format!(
                "   {} {}{}\n",
                "|".bright_blue(),
                " ".repeat(col.saturating_sub(1)),
                "^".red().bold()
            ));
        }
        out
    }
}

impl fmt::Display for PyleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} at {}", self.kind_label(), self.message(), self.location())
    }
}

impl std::error::Error for PyleError {}

/// Computes the Levenshtein distance between two strings, used for
/// "did you mean?" suggestions on undefined-name errors.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let (len1, len2) = (s1_chars.len(), s2_chars.len());

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }

    matrix[len1][len2]
}

/// Finds the closest match from a list of candidates, or `None` if nothing
/// is within a reasonable edit distance.
pub fn find_closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best_match = None;
    let mut best_distance = usize::MAX;

    for candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && distance < best_distance {
            best_distance = distance;
            best_match = Some(candidate.as_str());
        }
    }

    best_match
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_identical_is_zero() {
        assert_eq!(levenshtein_distance("hello", "hello"), 0);
    }

    #[test]
    fn closest_match_finds_typo() {
        let candidates = vec!["length".to_string(), "push".to_string()];
        assert_eq!(find_closest_match("lenght", &candidates), Some("length"));
    }

    #[test]
    fn display_includes_kind_and_location() {
        let err = PyleError::runtime(
            RuntimeErrorKind::DivisionByZero,
            "Division by zero",
            SourceLocation::with_file(3, 7, "main.pyle".to_string()),
        );
        let rendered = format!("{}", err);
        assert!(rendered.contains("Runtime"));
        assert!(rendered.contains("main.pyle:3:7"));
    }
}
