//! Benchmarks for the rewriting pipeline and prologue planning.
//!
//! Measures the work done on the host's load path:
//! - Pass-through of a class with nothing registered
//! - A chain of whole-class transforms
//! - Hook lookup among many hooks for other classes
//! - Planning a redirect over a typical function prologue

extern crate classweave;

use classweave::{
    patch::x86_64::plan_redirect, pipeline::TransformPipeline, MethodHook, Registry,
    RewriteResult, Transform,
};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

/// A class file sized like a typical application class.
fn class_bytes() -> Vec<u8> {
    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x00, 0x00, 0x41];
    bytes.resize(4096, 0x00);
    bytes
}

fn bench_pass_through(c: &mut Criterion) {
    let registry = Registry::new();
    let pipeline = TransformPipeline::new(true);
    let bytes = class_bytes();

    let mut group = c.benchmark_group("pipeline_pass_through");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("empty_registry", |b| {
        b.iter(|| {
            black_box(pipeline.apply(&registry, "com/example/Foo", black_box(bytes.clone())))
        });
    });
    group.finish();
}

fn bench_transform_chain(c: &mut Criterion) {
    let mut registry = Registry::new();
    for i in 0..8u8 {
        registry.add_transform(Transform::new(format!("t{i}"), move |_, bytes| {
            let mut out = bytes.to_vec();
            out.push(i);
            RewriteResult::Rewritten(out)
        }));
    }
    let bytes = class_bytes();

    let mut group = c.benchmark_group("pipeline_transform_chain");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    for catch_panics in [true, false] {
        let pipeline = TransformPipeline::new(catch_panics);
        let name = if catch_panics { "catch_panics" } else { "propagate_panics" };
        group.bench_function(name, |b| {
            b.iter(|| {
            black_box(pipeline.apply(&registry, "com/example/Foo", black_box(bytes.clone())))
        });
        });
    }
    group.finish();
}

fn bench_hook_lookup(c: &mut Criterion) {
    let mut registry = Registry::new();
    for i in 0..256 {
        registry.add_method_hook(MethodHook::new(
            format!("com/example/Other{i}"),
            "run",
            "()V",
            |_, _| RewriteResult::Unchanged,
        ));
    }
    registry.add_method_hook(MethodHook::new("com/example/Foo", "run", "()V", |_, _| {
        RewriteResult::Unchanged
    }));
    let pipeline = TransformPipeline::new(true);
    let bytes = class_bytes();

    c.bench_function("pipeline_hook_lookup_256", |b| {
        b.iter(|| {
            black_box(pipeline.apply(&registry, "com/example/Foo", black_box(bytes.clone())))
        });
    });
}

fn bench_plan_redirect(c: &mut Criterion) {
    // push rbp; mov rbp, rsp; sub rsp, 0x20; mov rax, [rip+0x100]; ret
    let prologue = [
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, 0x48, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00,
        0xC3,
    ];

    c.bench_function("plan_redirect_near", |b| {
        b.iter(|| {
            let plan = plan_redirect(black_box(&prologue), 0x7FF6_0000_1000, 0x7FF6_1000_0000)
                .unwrap();
            black_box(plan.relocate(0x7FF6_1000_0010).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_pass_through,
    bench_transform_chain,
    bench_hook_lookup,
    bench_plan_redirect
);
criterion_main!(benches);
