use crate::bytecode::decode::DecodeError;
use crate::lang::node::Span;
use crate::lang::value::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    Overflow,
    DivisionByZero,
    Type,
    StackOverflow,
    Thrown,
    Limit,
    /// Malformed bytecode or an ID outside every range. Compiler bug class.
    Internal,
}

impl RuntimeErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeErrorKind::Overflow => "overflow",
            RuntimeErrorKind::DivisionByZero => "division by zero",
            RuntimeErrorKind::Type => "type error",
            RuntimeErrorKind::StackOverflow => "stack overflow",
            RuntimeErrorKind::Thrown => "thrown",
            RuntimeErrorKind::Limit => "limit exceeded",
            RuntimeErrorKind::Internal => "internal error",
        }
    }

    /// Limit and internal errors end the run even inside a try block.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, RuntimeErrorKind::Limit | RuntimeErrorKind::Internal)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("runtime error: {message}{}", render_context(.span, .call_stack))]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub span: Option<Span>,
    pub call_stack: Vec<String>,
}

fn render_context(span: &Option<Span>, call_stack: &[String]) -> String {
    let mut out = String::new();
    if let Some(span) = span {
        out.push_str(&format!(" at {}", span));
    }
    if !call_stack.is_empty() {
        out.push_str("\n  call stack:");
        for (i, frame) in call_stack.iter().rev().enumerate() {
            out.push_str(&format!("\n    {}: {}", i, frame));
        }
    }
    out
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, msg: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: msg.into(),
            span: None,
            call_stack: Vec::new(),
        }
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        if self.span.is_none() {
            self.span = span;
        }
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    /// The value a catch register receives.
    pub fn to_value(&self) -> Value {
        Value::error(self.kind.name(), &self.message)
    }
}

impl From<DecodeError> for RuntimeError {
    fn from(e: DecodeError) -> Self {
        internal(e.to_string())
    }
}

// Constructors for the common failures. Messages name the operation and the
// operand types.

pub fn overflow(op: &str, ty: &str) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::Overflow,
        format!("integer overflow in {} ({}, {})", op, ty, ty),
    )
}

pub fn division_by_zero(op: &str) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::DivisionByZero,
        format!("division by zero in {}", op),
    )
}

pub fn type_error(op: &str, expected: &str, actual: &str) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::Type,
        format!("type error in {}: expected {}, got {}", op, expected, actual),
    )
}

pub fn operand_types(op: &str, a: &Value, b: &Value) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::Type,
        format!(
            "type error in {}: unsupported operands {} and {}",
            op,
            a.type_name(),
            b.type_name()
        ),
    )
}

pub fn stack_overflow(max: usize) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::StackOverflow,
        format!("stack overflow: call depth exceeded {} frames", max),
    )
}

pub fn internal(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::Internal, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_span_and_stack() {
        let e = overflow("ADD_I32_TYPED", "i32")
            .with_span(Some(Span::new(4, 9)))
            .with_context("fn f")
            .with_context("main");
        assert_eq!(
            e.to_string(),
            "runtime error: integer overflow in ADD_I32_TYPED (i32, i32) at 4:9\n  call stack:\n    0: main\n    1: fn f"
        );
    }

    #[test]
    fn test_first_span_wins() {
        let e = division_by_zero("DIV")
            .with_span(Some(Span::new(1, 1)))
            .with_span(Some(Span::new(2, 2)));
        assert_eq!(e.span, Some(Span::new(1, 1)));
    }

    #[test]
    fn test_error_value() {
        let v = type_error("JUMP_IF_NOT", "bool", "i32").to_value();
        assert_eq!(v.type_name(), "error");
        assert!(v.to_string().starts_with("type error: type error in JUMP_IF_NOT"));
    }

    #[test]
    fn test_internal_not_recoverable() {
        assert!(!RuntimeErrorKind::Internal.is_recoverable());
        assert!(!RuntimeErrorKind::Limit.is_recoverable());
        assert!(RuntimeErrorKind::Overflow.is_recoverable());
    }
}
