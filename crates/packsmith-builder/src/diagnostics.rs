//! Warnings and errors collected during a run.

use std::fmt;

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Never aborts the run.
    Warning,
    /// Reported; the pipeline decides separately whether to abort.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("Warning"),
            Self::Error => f.write_str("Error"),
        }
    }
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Module id or other input the finding is about.
    pub subject: Option<String>,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Findings in encounter order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    findings: Vec<Finding>,
}

impl Diagnostics {
    /// Empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            findings: Vec::new(),
        }
    }

    /// Record a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(Severity::Warning, message.into(), None);
    }

    /// Record a warning about a specific input.
    pub fn warn_about(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Warning, message.into(), Some(subject.into()));
    }

    /// Record an error about a specific input.
    pub fn error(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Error, message.into(), Some(subject.into()));
    }

    fn push(&mut self, severity: Severity, message: String, subject: Option<String>) {
        tracing::debug!(%severity, subject = ?subject, message = %message, "Diagnostic recorded");
        self.findings.push(Finding {
            severity,
            message,
            subject,
        });
    }

    /// Append another collection, keeping its order.
    pub fn extend(&mut self, other: Self) {
        self.findings.extend(other.findings);
    }

    /// Whether any error was recorded.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    /// Subjects of error findings, in order.
    #[must_use]
    pub fn error_subjects(&self) -> Vec<String> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .filter_map(|f| f.subject.clone())
            .collect()
    }

    /// Iterate findings.
    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter()
    }

    /// Number of findings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.findings.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// Hand the findings over for presentation.
    #[must_use]
    pub fn drain(self) -> Vec<Finding> {
        self.findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_encounter_order() {
        let mut first = Diagnostics::new();
        first.warn("one");
        first.error("example/node", "two");

        let mut second = Diagnostics::new();
        second.warn_about("example/go", "three");
        first.extend(second);

        let messages: Vec<_> = first.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, ["one", "two", "three"]);
        assert!(first.has_errors());
        assert_eq!(first.error_subjects(), ["example/node"]);
    }

    #[test]
    fn warnings_only_is_not_an_error() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.warn("empty 'order' definition");
        assert!(!diagnostics.has_errors());
        assert_eq!(
            diagnostics.drain()[0].to_string(),
            "Warning: empty 'order' definition"
        );
    }
}
