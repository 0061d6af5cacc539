//! Diagnostics sink
//!
//! Non-fatal findings (downgraded sub-action failures, skipped listing
//! items) are recorded here and handed back to the caller together with
//! the result or the error.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A single diagnostic entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    /// Attribute path the diagnostic refers to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match &self.path {
            Some(path) => write!(f, "{}: {} ({}): {}", level, self.summary, path, self.detail),
            None => write!(f, "{}: {}: {}", level, self.summary, self.detail),
        }
    }
}

/// Ordered list of diagnostics for one operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.record(Severity::Warning, summary.into(), detail.into(), None);
    }

    pub fn warn_at(
        &mut self,
        path: impl Into<String>,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.record(Severity::Warning, summary.into(), detail.into(), Some(path.into()));
    }

    pub fn error(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.record(Severity::Error, summary.into(), detail.into(), None);
    }

    fn record(&mut self, severity: Severity, summary: String, detail: String, path: Option<String>) {
        self.0.push(Diagnostic {
            severity,
            summary,
            detail,
            path,
        });
    }

    pub fn add(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_are_not_errors() {
        let mut diags = Diagnostics::new();
        diags.warn("assign failed", "403 Forbidden");
        diags.warn_at("assignments", "skipped", "unknown type");
        assert_eq!(diags.warnings().count(), 2);
        assert!(!diags.has_errors());

        diags.error("create failed", "boom");
        assert!(diags.has_errors());
        assert_eq!(diags.len(), 3);
    }

    #[test]
    fn test_display_includes_path() {
        let mut diags = Diagnostics::new();
        diags.warn_at("items[1]", "skipped item", "unknown derived type");
        let rendered = diags.iter().next().unwrap().to_string();
        assert_eq!(rendered, "warning: skipped item (items[1]): unknown derived type");
    }
}
