use std::fmt;

use crate::ast::Value;
use crate::types::{self, TypeKey};
use thiserror::Error;

#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    pub line: Option<u32>,
    pub function: Option<String>,
}

impl ErrorContext {
    fn set_line(&mut self, line: u32) {
        if self.line.is_none() {
            self.line = Some(line);
        }
    }

    fn set_function(&mut self, name: &str) {
        if self.function.is_none() {
            self.function = Some(name.to_string());
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeErrorData {
    pub message: String,
    pub context: ErrorContext,
}

impl RuntimeErrorData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }
}

impl fmt::Display for RuntimeErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Fatal to the top-level form being compiled.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub message: String,
    pub form: Option<Value>,
    pub line: Option<u32>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            form: None,
            line: None,
        }
    }

    /// Records the offending form and its line, keeping the innermost ones.
    pub fn at(mut self, form: &Value) -> Self {
        if self.form.is_none() {
            self.form = Some(form.clone());
        }
        if self.line.is_none() {
            self.line = form.line();
        }
        self
    }

    pub fn with_line(mut self, line: Option<u32>) -> Self {
        if self.line.is_none() {
            self.line = line;
        }
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "At line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CompileError {}

#[derive(Error, Debug, Clone)]
pub enum CinderError {
    #[error("{0}")]
    Compile(CompileError),

    #[error("{operation} not extended to handle: {type_name}")]
    Dispatch {
        operation: String,
        type_name: String,
        context: ErrorContext,
    },

    #[error("Arity mismatch: {0}")]
    Arity(RuntimeErrorData),

    #[error("Invalid reference state: {0}")]
    Validation(RuntimeErrorData),

    #[error("Illegal state: {0}")]
    IllegalState(RuntimeErrorData),

    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(RuntimeErrorData),

    #[error("Illegal argument: {0}")]
    IllegalArgument(RuntimeErrorData),

    #[error("Thrown: {0}")]
    Thrown(Value, ErrorContext),

    #[error("Runtime error: {0}")]
    Runtime(RuntimeErrorData),
}

impl CinderError {
    pub fn compile(message: impl Into<String>) -> Self {
        CinderError::Compile(CompileError::new(message))
    }

    pub fn dispatch(operation: impl Into<String>, type_name: impl Into<String>) -> Self {
        CinderError::Dispatch {
            operation: operation.into(),
            type_name: type_name.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn arity(message: impl Into<String>) -> Self {
        CinderError::Arity(RuntimeErrorData::new(message))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CinderError::Validation(RuntimeErrorData::new(message))
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        CinderError::IllegalState(RuntimeErrorData::new(message))
    }

    pub fn index_out_of_bounds(message: impl Into<String>) -> Self {
        CinderError::IndexOutOfBounds(RuntimeErrorData::new(message))
    }

    pub fn illegal_argument(message: impl Into<String>) -> Self {
        CinderError::IllegalArgument(RuntimeErrorData::new(message))
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        CinderError::Runtime(RuntimeErrorData::new(message))
    }

    pub fn thrown(value: Value) -> Self {
        CinderError::Thrown(value, ErrorContext::default())
    }

    pub fn with_line(mut self, line: Option<u32>) -> Self {
        if let Some(line) = line {
            if let CinderError::Compile(err) = &mut self {
                err.line.get_or_insert(line);
            } else if let Some(ctx) = self.context_mut() {
                ctx.set_line(line);
            }
        }
        self
    }

    pub fn with_function(mut self, name: &str) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.set_function(name);
        }
        self
    }

    pub fn line(&self) -> Option<u32> {
        match self {
            CinderError::Compile(err) => err.line,
            _ => self.context_ref().and_then(|ctx| ctx.line),
        }
    }

    pub fn function(&self) -> Option<&str> {
        self.context_ref().and_then(|ctx| ctx.function.as_deref())
    }

    /// Exception type a compiled `catch` clause matches against.
    pub fn exception_type(&self) -> TypeKey {
        match self {
            CinderError::Compile(_) => types::COMPILER_EXCEPTION,
            CinderError::Dispatch { .. } => types::PROTOCOL_EXCEPTION,
            CinderError::Arity(_) => types::ARITY_EXCEPTION,
            CinderError::Validation(_) | CinderError::IllegalState(_) => {
                types::ILLEGAL_STATE_EXCEPTION
            }
            CinderError::IndexOutOfBounds(_) => types::INDEX_OUT_OF_BOUNDS_EXCEPTION,
            CinderError::IllegalArgument(_) => types::ILLEGAL_ARGUMENT_EXCEPTION,
            CinderError::Thrown(value, _) => value.type_key(),
            CinderError::Runtime(_) => types::EXCEPTION,
        }
    }

    /// Value bound by a `catch` clause: the thrown value itself, or an
    /// exception instance describing a native failure.
    pub fn to_value(&self) -> Value {
        match self {
            CinderError::Thrown(value, _) => value.clone(),
            other => types::make_exception(other.exception_type(), &other.to_string()),
        }
    }

    fn context_ref(&self) -> Option<&ErrorContext> {
        match self {
            CinderError::Arity(data)
            | CinderError::Validation(data)
            | CinderError::IllegalState(data)
            | CinderError::IndexOutOfBounds(data)
            | CinderError::IllegalArgument(data)
            | CinderError::Runtime(data) => Some(&data.context),
            CinderError::Dispatch { context, .. } | CinderError::Thrown(_, context) => {
                Some(context)
            }
            CinderError::Compile(_) => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            CinderError::Arity(data)
            | CinderError::Validation(data)
            | CinderError::IllegalState(data)
            | CinderError::IndexOutOfBounds(data)
            | CinderError::IllegalArgument(data)
            | CinderError::Runtime(data) => Some(&mut data.context),
            CinderError::Dispatch { context, .. } | CinderError::Thrown(_, context) => {
                Some(context)
            }
            CinderError::Compile(_) => None,
        }
    }
}

impl From<CompileError> for CinderError {
    fn from(err: CompileError) -> Self {
        CinderError::Compile(err)
    }
}

impl From<String> for CinderError {
    fn from(message: String) -> Self {
        CinderError::runtime(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_reports_line() {
        let err = CompileError::new("bad let*").with_line(Some(7));
        assert_eq!(err.to_string(), "At line 7: bad let*");
    }

    #[test]
    fn dispatch_error_names_operation_and_type() {
        let err = CinderError::dispatch("count", "Int");
        assert_eq!(err.to_string(), "count not extended to handle: Int");
    }

    #[test]
    fn native_errors_map_to_exception_types() {
        assert_eq!(
            CinderError::arity("x").exception_type(),
            types::ARITY_EXCEPTION
        );
        assert_eq!(
            CinderError::validation("x").exception_type(),
            types::ILLEGAL_STATE_EXCEPTION
        );
    }
}
