//! FFI Registry
//!
//! Central registry for named libraries and the functions declared on them.

use std::collections::HashMap;
use std::path::Path;

use super::error::FfiError;
use super::loader::{LibraryHandle, Loader};
use super::types::{FfiSignature, FfiValue};
use crate::config::BridgeConfig;

/// Information about an FFI function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiFunctionInfo {
    /// Library name
    pub library: String,
    /// Function signature
    pub signature: FfiSignature,
    /// Description
    pub description: String,
}

impl FfiFunctionInfo {
    /// Create a new function info
    pub fn new(
        library: impl Into<String>,
        signature: FfiSignature,
        description: impl Into<String>,
    ) -> Self {
        Self {
            library: library.into(),
            signature,
            description: description.into(),
        }
    }

    /// `library:function`
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.library, self.signature.name)
    }
}

/// FFI Registry - named libraries and their declared functions
#[derive(Debug)]
pub struct FfiRegistry {
    /// Library loader
    loader: Loader,
    /// Loaded libraries by name
    libraries: HashMap<String, LibraryHandle>,
    /// Declared functions (qualified_name -> function_info)
    functions: HashMap<String, FfiFunctionInfo>,
}

impl FfiRegistry {
    /// Create a new FFI registry
    pub fn new() -> Self {
        Self::with_loader(Loader::new())
    }

    pub fn with_loader(loader: Loader) -> Self {
        Self {
            loader,
            libraries: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    /// Load every library in `config` and bind every declared function.
    ///
    /// Stops at the first load, parse or bind failure.
    ///
    /// # Safety
    ///
    /// Every signature in `config` must match its binary, as for
    /// [`LibraryHandle::bind`].
    pub unsafe fn from_config(config: &BridgeConfig) -> Result<Self, FfiError> {
        let mut registry = Self::with_loader(config.loader.build_loader());

        for library in &config.libraries {
            registry.load_library(&library.name, library.path.as_deref())?;

            for function in &library.functions {
                let signature = FfiSignature::parse(&function.signature)
                    .map_err(|e| FfiError::Bind(e.into()))?;
                let info =
                    FfiFunctionInfo::new(&library.name, signature, function.description.clone());
                registry.declare(info)?;
            }
        }

        Ok(registry)
    }

    /// Add a search path for libraries
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.loader.add_search_path(path);
    }

    /// Load a library from a path, or search for it by name
    pub fn load_library(&mut self, name: &str, path: Option<&str>) -> Result<(), FfiError> {
        if self.libraries.contains_key(name) {
            return Err(FfiError::DuplicateLibrary(name.to_string()));
        }
        let handle = self.loader.load(path.unwrap_or(name))?;
        self.libraries.insert(name.to_string(), handle);
        Ok(())
    }

    /// Declare a function on a loaded library, resolving its symbol now.
    ///
    /// Each `library:function` name can be declared once.
    ///
    /// # Safety
    ///
    /// `info.signature` must match the binary, as for [`LibraryHandle::bind`].
    pub unsafe fn declare(&mut self, info: FfiFunctionInfo) -> Result<(), FfiError> {
        let handle = self
            .libraries
            .get(&info.library)
            .ok_or_else(|| FfiError::LibraryNotFound(info.library.clone()))?;

        let qualified = info.qualified_name();
        if self.functions.contains_key(&qualified) {
            return Err(FfiError::DuplicateFunction(qualified));
        }

        handle.bind(&info.signature)?;

        self.functions.insert(qualified, info);
        Ok(())
    }

    /// Call a function by qualified name (library:function)
    pub fn call(&self, qualified_name: &str, args: &[FfiValue]) -> Result<FfiValue, FfiError> {
        let info = self
            .functions
            .get(qualified_name)
            .ok_or_else(|| FfiError::FunctionNotFound(qualified_name.to_string()))?;

        let handle = self
            .libraries
            .get(&info.library)
            .ok_or_else(|| FfiError::LibraryNotFound(info.library.clone()))?;

        // Safety: the signature was asserted when the function was declared.
        let binding = unsafe { handle.bind(&info.signature)? };
        Ok(binding.invoke(args)?)
    }

    /// Release a library and forget every function declared on it.
    pub fn unload(&mut self, name: &str) -> Result<(), FfiError> {
        let handle = self
            .libraries
            .remove(name)
            .ok_or_else(|| FfiError::LibraryNotFound(name.to_string()))?;
        self.functions.retain(|_, info| info.library != name);
        handle.release()?;
        Ok(())
    }

    /// Get a loaded library by name
    pub fn library(&self, name: &str) -> Option<&LibraryHandle> {
        self.libraries.get(name)
    }

    /// Get a function by qualified name
    pub fn get_function(&self, qualified_name: &str) -> Option<&FfiFunctionInfo> {
        self.functions.get(qualified_name)
    }

    /// List all declared functions, sorted by qualified name
    pub fn list_functions(&self) -> Vec<&FfiFunctionInfo> {
        let mut functions: Vec<_> = self.functions.values().collect();
        functions.sort_by_key(|info| info.qualified_name());
        functions
    }

    /// List all loaded libraries, sorted by name
    pub fn list_libraries(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.libraries.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for FfiRegistry {
    fn default() -> Self {
        Self::new()
    }
}
