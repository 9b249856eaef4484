//! Error kinds and propagation for script execution.
//!
//! Internally the interpreter threads [`RunError`] through every fallible
//! operation; at the host boundary it is flattened into the public
//! [`Exception`] type carrying the accumulated traceback.

use std::fmt::{self, Display};

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{pool::Pool, value::Value};

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Exception kinds known to the interpreter.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>`
/// implementations. The string representation matches the variant name exactly
/// (e.g. `ValueError` -> "ValueError").
///
/// The last two variants are host-facing faults rather than Python exception
/// classes: `DeserializeError` for malformed `.pyc` input and `OpcodeError`
/// for unknown or malformed instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr)]
pub enum ExcKind {
    /// Primary exception class - matches any script exception in handler checks.
    Exception,

    /// Intermediate class for arithmetic errors.
    ArithmeticError,
    /// Subclass of ArithmeticError.
    OverflowError,
    /// Subclass of ArithmeticError.
    ZeroDivisionError,

    /// Intermediate class for lookup errors.
    LookupError,
    /// Subclass of LookupError.
    IndexError,
    /// Subclass of LookupError.
    KeyError,

    AttributeError,
    ImportError,
    NameError,
    RuntimeError,
    StopIteration,
    TypeError,
    ValueError,

    /// Malformed `.pyc` image handed to the loader.
    DeserializeError,
    /// Unknown or malformed instruction reached the dispatcher.
    OpcodeError,
}

impl ExcKind {
    /// Checks whether `self` would be caught by a handler for `handler`.
    ///
    /// Implements the slice of Python's exception hierarchy the interpreter
    /// models: `Exception` catches everything, `ArithmeticError` is the base
    /// of the numeric errors and `LookupError` of the indexing errors.
    #[must_use]
    pub fn is_subclass_of(self, handler: Self) -> bool {
        if self == handler || handler == Self::Exception {
            return true;
        }
        match handler {
            Self::ArithmeticError => {
                matches!(self, Self::OverflowError | Self::ZeroDivisionError)
            }
            Self::LookupError => matches!(self, Self::IndexError | Self::KeyError),
            _ => false,
        }
    }

    /// Builds a [`RunError`] of this kind with the given message.
    pub(crate) fn err(self, message: impl Into<String>) -> RunError {
        RunError::new(self, message)
    }
}

/// A plain exception: a kind plus a formatted message.
///
/// This is what native code raises. Script-level `raise` statements carry
/// the raised instance as well, see [`Raised`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SimpleException {
    pub kind: ExcKind,
    pub message: String,
}

impl SimpleException {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// An exception raised by script code via `raise`.
///
/// Carries the exception instance and its class so `except` clauses can
/// match on either, and so a bare `raise` can re-throw the triple.
#[derive(Debug)]
pub(crate) struct Raised {
    /// The exception instance (an `Exception` pool object or any value the
    /// script raised).
    pub inst: Value,
    /// The class the instance was raised with (builtin kind or a class ref).
    pub class: Value,
}

/// Payload of a runtime error: either a native fault or a script `raise`.
#[derive(Debug)]
pub(crate) enum ExcPayload {
    Simple(SimpleException),
    Raised(Raised),
}

/// A runtime error travelling up the frame chain.
///
/// Each frame appends one [`StackFrame`] as the error unwinds through it,
/// so by the time the error reaches the host the traceback reads from the
/// call site down to the fault.
#[derive(Debug)]
pub(crate) struct RunError {
    pub payload: ExcPayload,
    pub traceback: Vec<StackFrame>,
}

impl RunError {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            payload: ExcPayload::Simple(SimpleException::new(kind, message)),
            traceback: Vec::new(),
        }
    }

    pub fn raised(inst: Value, class: Value) -> Self {
        Self {
            payload: ExcPayload::Raised(Raised { inst, class }),
            traceback: Vec::new(),
        }
    }

    /// Records the frame the error is currently unwinding through.
    pub fn push_frame(&mut self, filename: &str, line: u32, name: &str) {
        self.traceback.push(StackFrame {
            filename: filename.to_owned(),
            line,
            name: name.to_owned(),
        });
    }

    /// Releases any pool references held by the payload.
    ///
    /// Must be called when the error is dropped without being re-dispatched
    /// to a handler, otherwise the raised instance leaks until teardown.
    pub fn release(self, pool: &mut Pool) -> (ExcKind, String, Vec<StackFrame>) {
        match self.payload {
            ExcPayload::Simple(exc) => (exc.kind, exc.message, self.traceback),
            ExcPayload::Raised(raised) => {
                let kind = raised.builtin_kind().unwrap_or(ExcKind::Exception);
                let message = raised.inst.py_str(pool);
                raised.inst.release(pool);
                raised.class.release(pool);
                (kind, message, self.traceback)
            }
        }
    }
}

impl Raised {
    /// The builtin kind of the raised class, when it is one.
    pub fn builtin_kind(&self) -> Option<ExcKind> {
        match &self.class {
            Value::Builtin(crate::builtins::Builtin::Exc(kind)) => Some(*kind),
            _ => None,
        }
    }
}

/// One traceback entry: where execution was in a frame when it unwound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Source filename recorded in the code object.
    pub filename: String,
    /// Source line resolved through the line-number table.
    pub line: u32,
    /// Name of the code object (function name or `<module>`).
    pub name: String,
}

/// A script error surfaced to the host.
///
/// Produced when a fault unwinds out of the topmost `call` without being
/// handled by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    /// The closest builtin kind of the fault.
    pub kind: ExcKind,
    /// Human-readable message, without the kind prefix.
    pub message: String,
    /// Unwound frames, call site first.
    pub traceback: Vec<StackFrame>,
}

impl Exception {
    pub(crate) fn from_run_error(err: RunError, pool: &mut Pool) -> Self {
        let (kind, message, traceback) = err.release(pool);
        Self {
            kind,
            message,
            traceback,
        }
    }
}

impl Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.traceback.is_empty() {
            f.write_str("Traceback (most recent call last):\n")?;
            for frame in self.traceback.iter().rev() {
                writeln!(
                    f,
                    "  File \"{}\", line {}, in {}",
                    frame.filename, frame.line, frame.name
                )?;
            }
        }
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subclass_matching() {
        assert!(ExcKind::IndexError.is_subclass_of(ExcKind::LookupError));
        assert!(ExcKind::KeyError.is_subclass_of(ExcKind::Exception));
        assert!(ExcKind::ZeroDivisionError.is_subclass_of(ExcKind::ArithmeticError));
        assert!(!ExcKind::IndexError.is_subclass_of(ExcKind::ArithmeticError));
        assert!(ExcKind::TypeError.is_subclass_of(ExcKind::TypeError));
    }

    #[test]
    fn display_includes_kind() {
        let exc = SimpleException::new(ExcKind::ValueError, "bad literal");
        assert_eq!(exc.to_string(), "ValueError: bad literal");
    }
}
