//! dlbridge - call exported C entry points of shared libraries at run time
//!
//! Locates a compiled shared library on disk, maps it into the process,
//! resolves exported symbols by name and invokes them through the platform C
//! ABI, with no source-level integration with the language the library was
//! written in.
//!
//! # Features
//!
//! - **Loader**: search paths, platform file names and one failure surface
//!   (`NotFound`, `InvalidImage`, `InitializationFailed`) on every platform
//! - **Binder**: caller-declared C signatures such as `"i32 double_me(i32)"`
//!   bound to resolved symbols
//! - **Invoker**: integer, float, pointer, C string and buffer arguments,
//!   validated before any foreign code runs
//! - **Registry**: named libraries and declared functions, loadable from
//!   `dlbridge.toml`
//! - **Isolation**: optional subprocess boundary for untrusted libraries
//!
//! # Trust boundary
//!
//! Loading a library runs its initialization code with the full privileges
//! of the process. Binding a symbol asserts a signature the binary cannot
//! confirm, which is why [`ffi::LibraryHandle::bind`] is `unsafe`. A wrong
//! signature, or a fault inside foreign code, is not reported as an error:
//! it takes down the whole process. Run calls into libraries you do not
//! trust through [`isolate::IsolatedCall`] (or `dlb --isolate`).
//!
//! # Example
//!
//! ```no_run
//! use dlbridge::ffi::{FfiValue, Loader};
//!
//! let loader = Loader::new();
//! let lib = loader.load("libembed.so")?;
//!
//! // Safety: libembed exports `int32_t double_me(int32_t)`
//! let double_me = unsafe { lib.bind_decl("i32 double_me(i32)")? };
//! assert_eq!(double_me.invoke(&[FfiValue::Signed(21)])?, FfiValue::Signed(42));
//!
//! drop(double_me);
//! lib.release()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  dlb / caller   │  declares "ret name(params)"
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Loader      │  path resolution, libloading, image table
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  SymbolBinding  │  resolve + declared signature
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     invoke      │  lane marshalling, C ABI call
//! └─────────────────┘
//! ```

pub mod config;
pub mod ffi;
pub mod isolate;

pub use config::{BridgeConfig, ConfigError};
pub use ffi::{
    BindError, FfiError, FfiRegistry, FfiSignature, FfiType, FfiValue, InvocationResult,
    InvokeError, LibraryHandle, LoadError, Loader, SymbolBinding,
};
pub use isolate::{IsolatedCall, IsolationError, IsolationOutcome};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
