//! Benchmarks for dlbridge binding and invocation overhead

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dlbridge::ffi::{CallPolicy, FfiSignature, FfiValue, Loader};

fn probe_path() -> Option<&'static str> {
    option_env!("DLBRIDGE_PROBE_LIB")
}

/// Benchmark signature parsing
fn bench_parse_signature(c: &mut Criterion) {
    c.bench_function("parse_signature", |b| {
        b.iter(|| {
            let sig = FfiSignature::parse(black_box("double probe_mix(int32_t, double, int64_t, float)"));
            black_box(sig)
        })
    });
}

/// Benchmark bind (cached symbol lookup) and invoke
fn bench_invoke(c: &mut Criterion) {
    let Some(path) = probe_path() else {
        eprintln!("probe library was not built, skipping invoke benchmarks");
        return;
    };

    let mut group = c.benchmark_group("invoke");
    group.throughput(Throughput::Elements(1));

    for policy in [CallPolicy::Serialized, CallPolicy::Concurrent] {
        let mut loader = Loader::new();
        loader.set_call_policy(policy);
        let lib = loader.load(path).expect("probe library should load");

        let double_me = unsafe { lib.bind_decl("i32 double_me(i32)") }.expect("double_me");
        let args = [FfiValue::Signed(21)];
        group.bench_function(format!("double_me_{:?}", policy).to_lowercase(), |b| {
            b.iter(|| black_box(double_me.invoke(black_box(&args))))
        });

        let checksum = unsafe { lib.bind_decl("u64 probe_checksum(buffer)") }.expect("checksum");
        let buffer = [FfiValue::Buffer(vec![7u8; 256])];
        group.bench_function(format!("checksum_256_{:?}", policy).to_lowercase(), |b| {
            b.iter(|| black_box(checksum.invoke(black_box(&buffer))))
        });
    }

    let lib = Loader::new().load(path).expect("probe library should load");
    let sig = FfiSignature::parse("i32 double_me(i32)").expect("signature");
    group.bench_function("bind_cached", |b| {
        b.iter(|| black_box(unsafe { lib.bind(black_box(&sig)) }.is_ok()))
    });

    group.finish();
}

criterion_group!(benches, bench_parse_signature, bench_invoke);
criterion_main!(benches);
