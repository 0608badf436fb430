//! Load-time initialization side channel
//!
//! Lives in its own test binary: the probe's constructor only runs when the
//! image is first mapped into the process, so nothing else here may load it.

use dlbridge::ffi::{FfiValue, Loader};

#[test]
fn test_loading_runs_initializers() {
    let Some(path) = option_env!("DLBRIDGE_PROBE_LIB") else {
        eprintln!("skipping: probe library was not built");
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("init.log");
    std::env::set_var("DLBRIDGE_PROBE_MARKER", &marker);
    assert!(!marker.exists());

    let loader = Loader::new();
    let first = loader.load(path).unwrap();
    // The initializer ran before load returned
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "init\n");

    // A second handle shares the mapping; no second initialization
    let second = loader.load(path).unwrap();
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "init\n");

    let init_runs = unsafe { second.bind_decl("i32 probe_init_runs()") }.unwrap();
    assert_eq!(init_runs.invoke(&[]).unwrap(), FfiValue::Signed(1));
    drop(init_runs);

    first.release().unwrap();
    second.release().unwrap();
}
