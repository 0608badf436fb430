//! FFI Error Types
//!
//! Loader and binder failures are detected before any foreign code runs and
//! are always reported as typed errors. Faults raised *inside* foreign code
//! (bad signature, invalid memory access, abort) are not representable here:
//! they take down the process. Use [`crate::isolate`] when the library is
//! not trusted.

use std::path::PathBuf;

use thiserror::Error;

use super::types::FfiType;

/// Failure to map a library image into the process.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The path did not resolve to a file, on disk or through the platform search.
    #[error("library not found: '{path}'")]
    NotFound { path: String },

    /// The file exists but is not a loadable image for this platform/architecture.
    #[error("'{path}' is not a loadable library image: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    /// The image header is valid but the platform loader refused it.
    #[error("failed to initialize library '{path}': {reason}")]
    InitializationFailed { path: PathBuf, reason: String },

    /// The platform reported an error while closing the handle.
    #[error("failed to release library '{path}': {reason}")]
    ReleaseFailed { path: PathBuf, reason: String },
}

/// Failure to resolve an exported symbol against a loaded handle.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("symbol '{symbol}' not found in '{library}'")]
    SymbolNotFound { symbol: String, library: PathBuf },

    #[error("invalid symbol name {0:?}")]
    InvalidSymbol(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("cannot call '{signature}' on this target: {reason}")]
    UnsupportedSignature { signature: String, reason: String },
}

/// Argument validation failure, raised before control leaves the bridge.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("'{function}' expects {expected} argument(s), got {got}")]
    ArgCount {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("argument {index} of '{function}': expected {expected}, got {got}")]
    ArgType {
        function: String,
        index: usize,
        expected: FfiType,
        got: FfiType,
    },

    #[error("argument {index} of '{function}': {value} does not fit in {ty}")]
    OutOfRange {
        function: String,
        index: usize,
        value: i128,
        ty: FfiType,
    },

    #[error("argument {index} of '{function}': string contains an interior NUL byte")]
    InvalidString { function: String, index: usize },

    #[error("'{function}' needs {ints} integer and {floats} float register(s); the bridge supports at most {max_ints} and {max_floats}")]
    TooManyArgs {
        function: String,
        ints: usize,
        floats: usize,
        max_ints: usize,
        max_floats: usize,
    },

    #[error("argument {index} of '{function}': {reason}")]
    Unsupported {
        function: String,
        index: usize,
        reason: String,
    },
}

/// Malformed signature declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("missing parameter list in '{0}'")]
    MissingParens(String),

    #[error("missing return type or function name in '{0}'")]
    MissingName(String),

    #[error("'{0}' is not a valid function name")]
    InvalidName(String),

    #[error("empty parameter in '{0}'")]
    EmptyParam(String),

    #[error("'...' must be the last parameter in '{0}'")]
    MisplacedVariadic(String),

    #[error("'{0}' cannot be used as a parameter type")]
    InvalidParam(FfiType),

    #[error("'{0}' cannot be used as a return type")]
    InvalidReturn(FfiType),
}

/// Failure to read a textual argument as a value of a declared type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot read '{text}' as {ty}: {reason}")]
pub struct ParseValueError {
    pub text: String,
    pub ty: FfiType,
    pub reason: String,
}

/// Umbrella error for registry-level operations.
#[derive(Debug, Error)]
pub enum FfiError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("library '{0}' is not loaded")]
    LibraryNotFound(String),

    #[error("library name '{0}' is already in use")]
    DuplicateLibrary(String),

    #[error("function '{0}' is not declared")]
    FunctionNotFound(String),

    #[error("function '{0}' is already declared")]
    DuplicateFunction(String),
}
