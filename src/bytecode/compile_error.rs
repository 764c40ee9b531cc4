use crate::lang::node::Span;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Register space exhausted, including the spill range.
    #[error("compile error: too many local variables in {construct}")]
    TooManyLocals { construct: String, span: Span },

    /// A jump or handler offset does not fit in 16 bits.
    #[error("compile error: jump target too far in {construct} ({distance} bytes)")]
    JumpTooFar {
        construct: String,
        distance: usize,
        span: Span,
    },

    #[error("compile error: too many parameters for '{name}' ({count}, at most {max})")]
    TooManyParameters {
        name: String,
        count: usize,
        max: usize,
        span: Span,
    },

    #[error("compile error: too many arguments in call ({count}, at most 255)")]
    TooManyArguments { count: usize, span: Span },

    #[error("compile error: too many constants in one chunk")]
    TooManyConstants { span: Span },

    #[error("compile error: too many functions in one program")]
    TooManyFunctions { span: Span },

    #[error("compile error: too many captured variables in '{name}'")]
    TooManyUpvalues { name: String, span: Span },

    #[error("compile error: undefined variable '{name}'")]
    UndefinedVariable { name: String, span: Span },

    /// `break`/`continue` with no enclosing loop.
    #[error("compile error: '{keyword}' outside of a loop")]
    OutsideLoop { keyword: &'static str, span: Span },

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("compile error: internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn too_many_locals(construct: impl Into<String>, span: Span) -> Self {
        CompileError::TooManyLocals {
            construct: construct.into(),
            span,
        }
    }

    pub fn jump_too_far(construct: impl Into<String>, distance: usize, span: Span) -> Self {
        CompileError::JumpTooFar {
            construct: construct.into(),
            distance,
            span,
        }
    }

    pub fn undefined(name: &str, span: Span) -> Self {
        CompileError::UndefinedVariable {
            name: name.to_string(),
            span,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::TooManyLocals { span, .. }
            | CompileError::JumpTooFar { span, .. }
            | CompileError::TooManyParameters { span, .. }
            | CompileError::TooManyArguments { span, .. }
            | CompileError::TooManyConstants { span }
            | CompileError::TooManyFunctions { span }
            | CompileError::TooManyUpvalues { span, .. }
            | CompileError::UndefinedVariable { span, .. }
            | CompileError::OutsideLoop { span, .. } => Some(*span),
            CompileError::Internal(_) => None,
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CompileError::TooManyLocals { .. } => {
                Some("split the function or reduce the number of simultaneously live values")
            }
            CompileError::JumpTooFar { .. } => Some("move part of the body into a function"),
            CompileError::UndefinedVariable { .. } => {
                Some("declare the variable with `let` before using it")
            }
            _ => None,
        }
    }
}
