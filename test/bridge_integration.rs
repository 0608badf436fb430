//! Bridge integration tests against the probe library built by build.rs

use dlbridge::config::BridgeConfig;
use dlbridge::ffi::{images, BindError, FfiError, FfiRegistry, FfiValue, LoadError, Loader};

/// Path of the probe library, or skip the test when it was not built.
macro_rules! probe_or_skip {
    () => {
        match option_env!("DLBRIDGE_PROBE_LIB") {
            Some(path) => path,
            None => {
                eprintln!("skipping: probe library was not built");
                return;
            }
        }
    };
}

#[test]
fn test_void_call_returns_completion_marker() {
    let path = probe_or_skip!();
    let lib = Loader::new().load(path).unwrap();

    let process = unsafe { lib.bind_decl("void process()") }.unwrap();
    let touch_count = unsafe { lib.bind_decl("u64 probe_touch_count()") }.unwrap();

    let before = touch_count.invoke(&[]).unwrap().as_u64().unwrap();
    assert_eq!(process.invoke(&[]).unwrap(), FfiValue::Void);
    assert!(process.invoke(&[]).unwrap().is_void());
    let after = touch_count.invoke(&[]).unwrap().as_u64().unwrap();
    assert_eq!(after, before + 2);
}

#[test]
fn test_misspelled_symbol_is_not_invoked() {
    let path = probe_or_skip!();
    let lib = Loader::new().load(path).unwrap();

    let err = unsafe { lib.bind_decl("void proces()") }.unwrap_err();
    match err {
        BindError::SymbolNotFound { symbol, library } => {
            assert_eq!(symbol, "proces");
            assert_eq!(library, lib.path());
        }
        other => panic!("expected SymbolNotFound, got {:?}", other),
    }
}

#[test]
fn test_pure_function_is_idempotent() {
    let path = probe_or_skip!();
    let lib = Loader::new().load(path).unwrap();
    let double_me = unsafe { lib.bind_decl("int32_t double_me(int32_t x)") }.unwrap();

    let first = double_me.invoke(&[FfiValue::Signed(21)]).unwrap();
    let second = double_me.invoke(&[FfiValue::Signed(21)]).unwrap();
    assert_eq!(first, FfiValue::Signed(42));
    assert_eq!(first, second);

    assert_eq!(
        double_me.invoke(&[FfiValue::Signed(-21)]).unwrap(),
        FfiValue::Signed(-42)
    );
}

#[test]
fn test_integer_widths() {
    let path = probe_or_skip!();
    let lib = Loader::new().load(path).unwrap();

    let add = unsafe { lib.bind_decl("i64 probe_add(i64, i64)") }.unwrap();
    assert_eq!(
        add.invoke(&[FfiValue::Signed(i64::MAX - 1), FfiValue::Integer(1)]).unwrap(),
        FfiValue::Signed(i64::MAX)
    );

    let negate = unsafe { lib.bind_decl("i8 probe_negate8(i8)") }.unwrap();
    assert_eq!(negate.invoke(&[FfiValue::Signed(5)]).unwrap(), FfiValue::Signed(-5));
    assert_eq!(
        negate.invoke(&[FfiValue::Signed(-128)]).unwrap(),
        FfiValue::Signed(-128)
    );
    assert!(negate.invoke(&[FfiValue::Signed(128)]).is_err());
}

#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
#[test]
fn test_float_marshalling() {
    let path = probe_or_skip!();
    let lib = Loader::new().load(path).unwrap();

    let mix = unsafe { lib.bind_decl("double probe_mix(int32_t, double, int64_t, float)") }.unwrap();
    let result = mix
        .invoke(&[
            FfiValue::Signed(1),
            FfiValue::Float(2.5),
            FfiValue::Signed(3),
            FfiValue::Float(0.5),
        ])
        .unwrap();
    assert_eq!(result, FfiValue::Float(86.0));

    let halve = unsafe { lib.bind_decl("f32 probe_halve(f32)") }.unwrap();
    assert_eq!(halve.invoke(&[FfiValue::Float(3.0)]).unwrap(), FfiValue::Float(1.5));
}

#[test]
fn test_strings_and_buffers() {
    let path = probe_or_skip!();
    let lib = Loader::new().load(path).unwrap();

    let strlen = unsafe { lib.bind_decl("u64 probe_strlen(const char *s)") }.unwrap();
    assert_eq!(
        strlen.invoke(&[FfiValue::String("hello".to_string())]).unwrap(),
        FfiValue::Integer(5)
    );
    assert_eq!(strlen.invoke(&[FfiValue::Pointer(0)]).unwrap(), FfiValue::Integer(0));

    let checksum = unsafe { lib.bind_decl("u64 probe_checksum(buffer)") }.unwrap();
    assert_eq!(
        checksum.invoke(&[FfiValue::Buffer(vec![1, 2, 3])]).unwrap(),
        FfiValue::Integer(1026)
    );
    assert_eq!(
        checksum.invoke(&[FfiValue::Buffer(Vec::new())]).unwrap(),
        FfiValue::Integer(0)
    );
}

#[test]
fn test_initializer_ran_once_per_mapping() {
    let path = probe_or_skip!();
    let first = Loader::new().load(path).unwrap();
    let second = Loader::new().load(path).unwrap();

    let init_runs = unsafe { second.bind_decl("i32 probe_init_runs()") }.unwrap();
    assert_eq!(init_runs.invoke(&[]).unwrap(), FfiValue::Signed(1));
    drop(init_runs);

    first.release().unwrap();
    second.release().unwrap();
}

#[test]
fn test_image_table_tracks_each_handle() {
    let path = probe_or_skip!();
    // A private copy, so no other test touches this image's counts
    let dir = tempfile::tempdir().unwrap();
    let copy = dir.path().join("libdlprobe_table.so");
    std::fs::copy(path, &copy).unwrap();
    let copy_str = copy.to_str().unwrap();

    let loader = Loader::new();
    let first = loader.load(copy_str).unwrap();
    let second = loader.load(copy_str).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(images::live_handles(&copy), 2);

    let record = images::snapshot()
        .into_iter()
        .find(|image| image.live_handles.contains(&first.id()))
        .unwrap();
    assert_eq!(record.live_handles, vec![first.id(), second.id()]);
    assert_eq!(record.total_loads, 2);

    first.release().unwrap();
    assert_eq!(images::live_handles(&copy), 1);

    // The remaining handle still works
    let double_me = unsafe { second.bind_decl("i32 double_me(i32)") }.unwrap();
    assert_eq!(double_me.invoke(&[FfiValue::Signed(2)]).unwrap(), FfiValue::Signed(4));
    drop(double_me);

    second.release().unwrap();
    assert_eq!(images::live_handles(&copy), 0);
}

#[test]
fn test_reload_after_release() {
    let path = probe_or_skip!();
    let loader = Loader::new();

    let lib = loader.load(path).unwrap();
    let double_me = unsafe { lib.bind_decl("i32 double_me(i32)") }.unwrap();
    for _ in 0..3 {
        assert_eq!(double_me.invoke(&[FfiValue::Signed(5)]).unwrap(), FfiValue::Signed(10));
    }
    drop(double_me);
    lib.release().unwrap();

    let lib = loader.load(path).unwrap();
    let double_me = unsafe { lib.bind_decl("i32 double_me(i32)") }.unwrap();
    assert_eq!(double_me.invoke(&[FfiValue::Signed(5)]).unwrap(), FfiValue::Signed(10));
}

#[test]
fn test_missing_file_next_to_probe() {
    let path = probe_or_skip!();
    let missing = std::path::Path::new(path).with_file_name("libdlprobe_missing.so");
    let err = Loader::new().load(missing.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, LoadError::NotFound { .. }));
}

#[test]
fn test_load_by_name_from_search_path() {
    let path = probe_or_skip!();
    let dir = std::path::Path::new(path).parent().unwrap();

    let mut loader = Loader::new();
    loader.add_search_path(dir);
    loader.set_system_paths(false);
    let lib = loader.load("dlprobe").unwrap();
    assert_eq!(lib.path(), std::fs::canonicalize(path).unwrap());
}

#[test]
fn test_registry_from_config() {
    let path = probe_or_skip!();
    let toml = format!(
        r#"
[[libraries]]
name = "probe"
path = "{}"

[[libraries.functions]]
signature = "i32 double_me(i32)"
description = "Double an integer"

[[libraries.functions]]
signature = "u64 probe_strlen(cstr)"
"#,
        path
    );
    let config = BridgeConfig::parse(&toml).unwrap();

    let mut registry = unsafe { FfiRegistry::from_config(&config) }.unwrap();
    assert_eq!(registry.list_libraries(), vec!["probe"]);
    assert_eq!(registry.list_functions().len(), 2);
    assert_eq!(
        registry.get_function("probe:double_me").unwrap().description,
        "Double an integer"
    );

    assert_eq!(
        registry.call("probe:double_me", &[FfiValue::Signed(4)]).unwrap(),
        FfiValue::Signed(8)
    );
    assert_eq!(
        registry
            .call("probe:probe_strlen", &[FfiValue::String("abc".to_string())])
            .unwrap(),
        FfiValue::Integer(3)
    );
    assert!(matches!(
        registry.call("probe:double_me", &[]),
        Err(FfiError::Invoke(_))
    ));

    registry.unload("probe").unwrap();
    assert!(registry.list_functions().is_empty());
}

#[test]
fn test_registry_from_config_missing_symbol() {
    let path = probe_or_skip!();
    let toml = format!(
        "[[libraries]]\nname = \"probe\"\npath = \"{}\"\n\n[[libraries.functions]]\nsignature = \"void proces()\"\n",
        path
    );
    let config = BridgeConfig::parse(&toml).unwrap();
    let err = unsafe { FfiRegistry::from_config(&config) }.unwrap_err();
    assert!(matches!(err, FfiError::Bind(BindError::SymbolNotFound { .. })));
}

#[test]
fn test_serialized_calls_from_threads() {
    let path = probe_or_skip!();
    let lib = Loader::new().load(path).unwrap();
    let add = unsafe { lib.bind_decl("i64 probe_add(i64, i64)") }.unwrap();

    std::thread::scope(|s| {
        for t in 0..8i64 {
            let add = &add;
            s.spawn(move || {
                for i in 0..100i64 {
                    let result = add.invoke(&[FfiValue::Signed(t), FfiValue::Signed(i)]).unwrap();
                    assert_eq!(result, FfiValue::Signed(t + i));
                }
            });
        }
    });
}
