//! Runtime error kinds and the internal unwinding signal.

use lunette_core::string::Interner;
use lunette_core::value::Value;
use thiserror::Error;

/// Errors observable at the embedding boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VmError {
    /// Compilation rejected the source (raised by the external compiler,
    /// carried through the embedding load path).
    #[error("syntax error: {0}")]
    Syntax(String),

    /// An operand failed coercion or an argument check.
    #[error("{0}")]
    TypeMismatch(String),

    /// Nil or invalid table indexing with no metamethod to resort to.
    #[error("{0}")]
    Index(String),

    /// Arithmetic or concatenation on incompatible operands.
    #[error("{0}")]
    Arith(String),

    /// The per-thread slot ceiling was exceeded.
    #[error("stack overflow")]
    StackOverflow,

    /// User-thrown via the error primitive, with a string payload.
    #[error("{0}")]
    Runtime(String),

    /// Embedding-level file load failed.
    #[error("{0}")]
    File(String),

    /// Resume of a dead coroutine, yield from outside one, or a yield that
    /// would cross a host-call boundary.
    #[error("{0}")]
    Coroutine(String),

    /// User-thrown via the error primitive with a non-string payload.
    #[error("error object is a {} value", .0.type_name())]
    Thrown(Value),
}

impl VmError {
    /// The error as a stack value, for the protected-call boundary.
    pub fn to_value(&self, strings: &mut Interner) -> Value {
        match self {
            VmError::Thrown(v) => *v,
            other => {
                let msg = other.to_string();
                Value::Str(strings.intern(msg.as_bytes()))
            }
        }
    }

    /// Prepend a `chunk:line:` position prefix to the message payload.
    /// Values thrown via the error primitive pass through untouched.
    pub fn with_location(self, prefix: &str) -> VmError {
        if prefix.is_empty() {
            return self;
        }
        match self {
            VmError::Syntax(m) => VmError::Syntax(format!("{prefix}{m}")),
            VmError::TypeMismatch(m) => VmError::TypeMismatch(format!("{prefix}{m}")),
            VmError::Index(m) => VmError::Index(format!("{prefix}{m}")),
            VmError::Arith(m) => VmError::Arith(format!("{prefix}{m}")),
            VmError::Runtime(m) => VmError::Runtime(format!("{prefix}{m}")),
            VmError::File(m) => VmError::File(format!("{prefix}{m}")),
            VmError::Coroutine(m) => VmError::Coroutine(format!("{prefix}{m}")),
            e @ (VmError::StackOverflow | VmError::Thrown(_)) => e,
        }
    }
}

/// Non-local control flow inside the VM: error unwinding and coroutine
/// suspension. Host functions return this in their `Err` arm.
#[derive(Debug, Clone)]
pub enum Control {
    Error(VmError),
    /// Values being yielded, already popped from the yielding frame.
    Yield(Vec<Value>),
}

impl From<VmError> for Control {
    fn from(e: VmError) -> Self {
        Control::Error(e)
    }
}

/// What a host function returns: the number of results left on top of its
/// stack, or an unwinding signal.
pub type HostResult = Result<usize, Control>;
