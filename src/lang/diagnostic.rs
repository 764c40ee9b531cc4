use super::node::Span;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    CompileError,
    RuntimeError,
}

/// One report handed to the diagnostics collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub span: Option<Span>,
    pub message: String,
    /// Suggested fix, when the error has one.
    pub hint: Option<&'static str>,
}

/// Receives error reports. Formatting belongs to the sink; reporting never
/// changes control flow.
pub trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);
}

/// Sink that keeps every report.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl DiagnosticSink for Diagnostics {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }
}

/// Sink that forwards reports to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&mut self, d: Diagnostic) {
        let hint = d.hint.unwrap_or_default();
        match d.span {
            Some(span) => warn!(kind = ?d.kind, at = %span, hint, "{}", d.message),
            None => warn!(kind = ?d.kind, hint, "{}", d.message),
        }
    }
}
