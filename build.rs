//! Build script for the dlbridge probe library
//!
//! Compiles `fixtures/probe.c` into a shared library with the host C compiler
//! and exports its path to tests and benches as `DLBRIDGE_PROBE_LIB`. When no
//! compiler is available the variable is left unset and the tests that need
//! the probe skip themselves.

use std::env;
use std::path::{Path, PathBuf};

const PROBE_SOURCE: &str = "fixtures/probe.c";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", PROBE_SOURCE);

    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => return,
    };
    let target = env::var("TARGET").unwrap_or_default();

    if target.contains("windows") {
        println!("cargo:warning=probe library is not built on Windows targets");
        return;
    }

    let file_name = if target.contains("apple") {
        "libdlprobe.dylib"
    } else {
        "libdlprobe.so"
    };
    let output = out_dir.join(file_name);

    match build_probe(Path::new(PROBE_SOURCE), &output, &target) {
        Ok(()) => println!("cargo:rustc-env=DLBRIDGE_PROBE_LIB={}", output.display()),
        Err(reason) => println!("cargo:warning=probe library not built: {}", reason),
    }
}

fn build_probe(source: &Path, output: &Path, target: &str) -> Result<(), String> {
    let compiler = cc::Build::new()
        .cargo_metadata(false)
        .pic(true)
        .opt_level(1)
        .try_get_compiler()
        .map_err(|e| e.to_string())?;

    let mut command = compiler.to_command();
    if target.contains("apple") {
        command.arg("-dynamiclib");
    } else {
        command.arg("-shared");
    }
    command.arg("-o").arg(output).arg(source);

    let status = command
        .status()
        .map_err(|e| format!("failed to run {}: {}", compiler.path().display(), e))?;
    if !status.success() {
        return Err(format!("{} exited with {}", compiler.path().display(), status));
    }
    Ok(())
}
