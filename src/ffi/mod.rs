//! FFI Module for dlbridge
//!
//! Loads native shared libraries at runtime, resolves exported symbols and
//! calls them through a declared C signature.
//!
//! # Architecture
//!
//! ```text
//! "i32 double_me(i32)"
//!       │
//!       ▼
//! FfiSignature (parsed + checked)
//!       │
//!       ▼
//! Loader::load ──► LibraryHandle (libloading, image table)
//!       │
//!       ▼
//! LibraryHandle::bind ──► SymbolBinding<'lib>
//!       │
//!       ▼
//! SymbolBinding::invoke (lane marshalling)
//!       │
//!       ▼
//! Native Function Call
//! ```
//!
//! # Lifetimes
//!
//! - A [`LibraryHandle`] keeps its image mapped until it is released or
//!   dropped. Releasing consumes the handle.
//! - A [`SymbolBinding`] borrows its handle, so the image cannot be released
//!   while a binding is still around.
//! - Loading the same file twice yields two handles with their own ids; the
//!   image stays mapped until both are gone.
//!
//! # Example
//!
//! ```ignore
//! let loader = Loader::new();
//! let lib = loader.load("libm.so.6")?;
//!
//! // Safety: cos really is `double cos(double)`
//! let cos = unsafe { lib.bind_decl("f64 cos(f64)")? };
//! let result = cos.invoke(&[FfiValue::Float(0.0)])?;
//! assert_eq!(result.as_f64(), Some(1.0));
//!
//! drop(cos);
//! lib.release()?;
//! ```

mod error;
pub mod images;
mod invoke;
mod loader;
mod registry;
mod types;

pub use error::{BindError, FfiError, InvokeError, LoadError, ParseValueError, SignatureError};
pub use images::{HandleId, ImageInfo};
pub use invoke::{InvocationResult, SymbolBinding, MAX_FLOAT_LANES, MAX_INT_LANES};
pub use loader::{library_filename, CallPolicy, LibraryHandle, Loader, LIBRARY_PATH_ENV};
pub use registry::{FfiFunctionInfo, FfiRegistry};
pub use types::{FfiSignature, FfiType, FfiValue};
