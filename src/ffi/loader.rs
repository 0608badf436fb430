//! Dynamic Library Loader
//!
//! Safe wrapper around libloading for loading shared libraries.
//!
//! Loading an image runs its initializers (ELF constructors, `DllMain`)
//! before [`Loader::load`] returns. That code executes with the full
//! privileges of the process: only load libraries whose provenance you trust.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::{BindError, LoadError};
use super::images::{self, HandleId};

/// Environment variable with extra library directories, separated like `PATH`.
pub const LIBRARY_PATH_ENV: &str = "DLBRIDGE_LIBRARY_PATH";

/// How invocations into one image may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPolicy {
    /// One invocation at a time per image, across every handle to it.
    /// Foreign code is assumed not to be thread-safe unless its
    /// documentation says otherwise.
    #[default]
    Serialized,
    /// Invocations may run concurrently from several threads.
    Concurrent,
}

/// A successfully loaded library image.
///
/// A handle only exists once the image is mapped, initialized and recorded
/// in the [image table](super::images). [`release`](Self::release) consumes
/// it, and every [`SymbolBinding`](super::SymbolBinding) borrows it, so a
/// handle cannot be released while a binding derived from it is alive.
/// Dropping a handle releases it as well.
pub struct LibraryHandle {
    id: HandleId,
    /// Resolved path (or platform name for system-resolved loads)
    path: PathBuf,
    /// The loaded library handle; `None` only while being released
    library: Option<Library>,
    /// Cached symbol addresses
    symbols: Mutex<HashMap<String, usize>>,
    /// Shared with every other handle to the same image
    call_lock: Arc<Mutex<()>>,
    call_policy: CallPolicy,
}

impl LibraryHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Get the path to this library
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn call_policy(&self) -> CallPolicy {
        self.call_policy
    }

    /// Resolve an exported symbol to its address.
    ///
    /// Addresses are cached for the lifetime of the handle. Resolving a name
    /// never runs foreign code.
    pub fn resolve(&self, name: &str) -> Result<usize, BindError> {
        if let Some(&addr) = self.symbols.lock().get(name) {
            tracing::trace!(symbol = name, handle = %self.id, "symbol cache hit");
            return Ok(addr);
        }

        if name.is_empty() {
            return Err(BindError::InvalidSymbol(name.to_string()));
        }
        let c_name =
            CString::new(name).map_err(|_| BindError::InvalidSymbol(name.to_string()))?;

        let not_found = || BindError::SymbolNotFound {
            symbol: name.to_string(),
            library: self.path.clone(),
        };
        let library = self.library.as_ref().ok_or_else(not_found)?;

        // Safety: the symbol is only read as an address here. Treating it as a
        // callable happens in `bind`, under the caller's signature assertion.
        let symbol: Symbol<*const c_void> = unsafe {
            library.get(c_name.as_bytes_with_nul()).map_err(|e| {
                tracing::debug!(symbol = name, library = %self.path.display(), error = %e, "symbol lookup failed");
                not_found()
            })?
        };

        let addr = *symbol as usize;
        if addr == 0 {
            return Err(not_found());
        }

        self.symbols.lock().insert(name.to_string(), addr);
        tracing::debug!(symbol = name, address = addr, handle = %self.id, "resolved symbol");
        Ok(addr)
    }

    /// Whether `name` is exported by the image.
    pub fn has_symbol(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    pub(super) fn call_lock(&self) -> Option<parking_lot::MutexGuard<'_, ()>> {
        match self.call_policy {
            CallPolicy::Serialized => Some(self.call_lock.lock()),
            CallPolicy::Concurrent => None,
        }
    }

    /// Whether calls through `self` and `other` are serialized against each other.
    pub fn shares_call_lock(&self, other: &LibraryHandle) -> bool {
        Arc::ptr_eq(&self.call_lock, &other.call_lock)
    }

    /// Close the platform handle and drop this handle's reference to the image.
    ///
    /// The platform keeps the image mapped while other handles reference it.
    pub fn release(mut self) -> Result<(), LoadError> {
        let Some(library) = self.library.take() else {
            return Ok(());
        };
        tracing::debug!(handle = %self.id, path = %self.path.display(), "releasing library");
        library.close().map_err(|e| LoadError::ReleaseFailed {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        // Library's own Drop closes the platform handle
        self.library.take();
        images::deregister(self.id, &self.path);
    }
}

impl std::fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("call_policy", &self.call_policy)
            .field("cached_symbols", &self.symbols.lock().len())
            .finish()
    }
}

/// Where a load request resolved to before asking the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoadTarget {
    /// A file that exists on disk
    File(PathBuf),
    /// A bare name left to the platform loader's own search
    System(String),
}

/// Library loader with search paths
#[derive(Debug, Clone)]
pub struct Loader {
    /// Configured search paths, searched after the current directory
    search_paths: Vec<PathBuf>,
    /// Whether to search the platform's default directories
    system_paths: bool,
    call_policy: CallPolicy,
}

impl Loader {
    /// Create a new library loader
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
            system_paths: true,
            call_policy: CallPolicy::default(),
        }
    }

    /// Add a search path
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn set_system_paths(&mut self, enabled: bool) {
        self.system_paths = enabled;
    }

    /// Policy given to every handle this loader creates.
    pub fn set_call_policy(&mut self, policy: CallPolicy) {
        self.call_policy = policy;
    }

    pub fn call_policy(&self) -> CallPolicy {
        self.call_policy
    }

    /// Directories searched for bare library names, in order: current
    /// directory, configured paths, `DLBRIDGE_LIBRARY_PATH`, platform defaults.
    pub fn search_order(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        paths.extend(self.search_paths.iter().cloned());
        if let Some(extra) = std::env::var_os(LIBRARY_PATH_ENV) {
            paths.extend(std::env::split_paths(&extra));
        }
        if self.system_paths {
            paths.extend(default_search_paths());
        }

        paths
    }

    /// Find a library by name
    pub fn find_library(&self, name: &str) -> Option<PathBuf> {
        let lib_name = library_filename(name);

        for dir in self.search_order() {
            for candidate in [dir.join(name), dir.join(&lib_name)] {
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }

        None
    }

    fn resolve_target(&self, requested: &str) -> Result<LoadTarget, LoadError> {
        // dlopen("") hands back the main program
        if requested.trim().is_empty() {
            return Err(LoadError::NotFound {
                path: requested.to_string(),
            });
        }

        let as_path = Path::new(requested);
        if looks_like_path(as_path) {
            let absolute = if as_path.is_absolute() {
                as_path.to_path_buf()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(as_path))
                    .unwrap_or_else(|_| as_path.to_path_buf())
            };
            // symlink_metadata so a dangling link still counts as "exists"
            if std::fs::symlink_metadata(&absolute).is_err() {
                return Err(LoadError::NotFound {
                    path: requested.to_string(),
                });
            }
            return Ok(LoadTarget::File(canonical(absolute)));
        }

        Ok(match self.find_library(requested) {
            Some(found) => LoadTarget::File(canonical(found)),
            None => LoadTarget::System(requested.to_string()),
        })
    }

    /// Map a library into the process.
    ///
    /// Every call yields an independent handle, even for a path that is
    /// already loaded; the platform may share the underlying mapping.
    pub fn load(&self, path: &str) -> Result<LibraryHandle, LoadError> {
        let target = self.resolve_target(path)?;
        tracing::debug!(requested = path, target = ?target, "loading library");

        let opened = match &target {
            // Safety: loading runs the image's initializers. Trusting the
            // library's provenance is the caller's responsibility.
            LoadTarget::File(file) => unsafe { Library::new(file) },
            LoadTarget::System(name) => unsafe { Library::new(name) },
        };

        let library = opened.map_err(|e| classify_failure(path, &target, &e.to_string()))?;

        let resolved = match target {
            LoadTarget::File(file) => file,
            LoadTarget::System(name) => PathBuf::from(name),
        };
        let (id, call_lock) = images::register(&resolved);
        tracing::info!(handle = %id, path = %resolved.display(), "loaded library");

        Ok(LibraryHandle {
            id,
            path: resolved,
            library: Some(library),
            symbols: Mutex::new(HashMap::new()),
            call_lock,
            call_policy: self.call_policy,
        })
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

fn looks_like_path(path: &Path) -> bool {
    path.is_absolute() || path.components().count() > 1
}

fn canonical(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}

/// Loader messages that mean "this file is not an image we can map"
/// rather than "the image failed to come up".
const FORMAT_MISMATCH_HINTS: &[&str] = &[
    "invalid elf header",
    "wrong elf class",
    "elf file",
    "file too short",
    "cannot dynamically load",
    "only et_dyn and et_exec",
    "not a mach-o file",
    "wrong architecture",
    "incompatible architecture",
    "not a valid win32 application",
    "os error 193",
];

fn mentions_format_mismatch(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    FORMAT_MISMATCH_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Map a platform loader error onto the location-independent failure surface.
fn classify_failure(requested: &str, target: &LoadTarget, reason: &str) -> LoadError {
    tracing::debug!(requested, reason, "platform loader refused library");

    let path = match target {
        LoadTarget::System(name) => {
            if mentions_format_mismatch(reason) {
                return LoadError::InvalidImage {
                    path: PathBuf::from(name),
                    reason: reason.to_string(),
                };
            }
            return LoadError::NotFound {
                path: requested.to_string(),
            };
        }
        LoadTarget::File(path) => path,
    };

    if path.is_dir() {
        return LoadError::InvalidImage {
            path: path.clone(),
            reason: "is a directory".to_string(),
        };
    }

    match read_header(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => LoadError::NotFound {
            path: requested.to_string(),
        },
        Err(e) => LoadError::InvalidImage {
            path: path.clone(),
            reason: e.to_string(),
        },
        Ok(header) if !has_image_magic(&header) => LoadError::InvalidImage {
            path: path.clone(),
            reason: format!("not a {} image", IMAGE_FORMAT),
        },
        Ok(_) if mentions_format_mismatch(reason) => LoadError::InvalidImage {
            path: path.clone(),
            reason: reason.to_string(),
        },
        Ok(_) => LoadError::InitializationFailed {
            path: path.clone(),
            reason: reason.to_string(),
        },
    }
}

/// First bytes of the file, enough for a magic-number check.
fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(4);
    File::open(path)?.take(4).read_to_end(&mut header)?;
    Ok(header)
}

#[cfg(all(unix, not(target_vendor = "apple")))]
const IMAGE_FORMAT: &str = "ELF";

#[cfg(all(unix, not(target_vendor = "apple")))]
fn has_image_magic(header: &[u8]) -> bool {
    header.starts_with(b"\x7fELF")
}

#[cfg(target_vendor = "apple")]
const IMAGE_FORMAT: &str = "Mach-O";

#[cfg(target_vendor = "apple")]
fn has_image_magic(header: &[u8]) -> bool {
    const MAGICS: [[u8; 4]; 5] = [
        [0xfe, 0xed, 0xfa, 0xce],
        [0xfe, 0xed, 0xfa, 0xcf],
        [0xce, 0xfa, 0xed, 0xfe],
        [0xcf, 0xfa, 0xed, 0xfe],
        [0xca, 0xfe, 0xba, 0xbe],
    ];
    MAGICS.iter().any(|magic| header.starts_with(magic))
}

#[cfg(windows)]
const IMAGE_FORMAT: &str = "PE";

#[cfg(windows)]
fn has_image_magic(header: &[u8]) -> bool {
    header.starts_with(b"MZ")
}

#[cfg(not(any(unix, windows)))]
const IMAGE_FORMAT: &str = "native";

#[cfg(not(any(unix, windows)))]
fn has_image_magic(_header: &[u8]) -> bool {
    true
}

/// Get the default library search paths for this platform
fn default_search_paths() -> Vec<PathBuf> {
    #[allow(unused_mut)]
    let mut paths = Vec::new();

    #[cfg(target_os = "linux")]
    {
        if let Some(ld_path) = std::env::var_os("LD_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&ld_path));
        }
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/usr/lib64"));
        paths.push(PathBuf::from("/lib64"));
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(dyld_path) = std::env::var_os("DYLD_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&dyld_path));
        }
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
        paths.push(PathBuf::from("/usr/lib"));
    }

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("C:\\Windows\\System32"));
        if let Some(path) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&path));
        }
    }

    paths
}

/// Construct the platform-specific library filename.
///
/// Names that already carry an extension (`libc.so.6`, `foo.dll`) are kept.
pub fn library_filename(name: &str) -> String {
    if Path::new(name).extension().is_some() {
        return name.to_string();
    }

    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") {
            format!("{}.dylib", name)
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(target_os = "windows")]
    {
        format!("{}.dll", name)
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        if name.starts_with("lib") {
            format!("{}.so", name)
        } else {
            format!("lib{}.so", name)
        }
    }
}

#[cfg(test)]
pub(super) fn classify_for_test(requested: &str, file: &Path, reason: &str) -> LoadError {
    classify_failure(requested, &LoadTarget::File(file.to_path_buf()), reason)
}
