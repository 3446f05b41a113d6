//! Integration tests for the engine lifecycle and the class-definition path.
//!
//! Every test runs the engine against in-process backends: the redirector hands out a recording
//! original entry point instead of patching code, and the runtime hands out fake global
//! references instead of calling into a VM.

use classweave::{
    host::{
        jbyte, jclass, jint, jobject, jsize, ClassHandle, DefineClassFn, EnvHandle, HostRuntime,
        JNIEnv,
    },
    prelude::*,
    DefineRequest, Registry, Stage, TransformPipeline,
};
use std::{
    cell::RefCell,
    ffi::{c_char, c_void, CStr},
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier, Mutex,
    },
    thread,
};

thread_local! {
    static DEFINED: RefCell<Vec<(String, Vec<u8>)>> = const { RefCell::new(Vec::new()) };
}

fn take_defined() -> Vec<(String, Vec<u8>)> {
    DEFINED.with(|defined| std::mem::take(&mut *defined.borrow_mut()))
}

unsafe extern "system" fn host_define(
    _env: *mut JNIEnv,
    name: *const c_char,
    _loader: jobject,
    buf: *const jbyte,
    len: jsize,
) -> jclass {
    let name = if name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(name).to_string_lossy().into_owned()
    };
    let bytes = std::slice::from_raw_parts(buf.cast::<u8>(), len as usize).to_vec();

    // The host refuses classes that start with 0xDE
    let rejected = bytes.first() == Some(&0xDE);
    DEFINED.with(|defined| defined.borrow_mut().push((name, bytes)));

    if rejected {
        ptr::null_mut()
    } else {
        NonNull::<c_void>::dangling().as_ptr()
    }
}

#[derive(Default)]
struct Counters {
    installs: AtomicUsize,
    restores: AtomicUsize,
}

struct RecordingRedirector {
    counters: Arc<Counters>,
    fail_with: Option<Error>,
}

impl Redirector for RecordingRedirector {
    fn install(
        &self,
        target: &TargetSymbol,
        _replacement: *const c_void,
    ) -> Result<InstalledRedirect> {
        self.counters.installs.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => {
                assert_eq!(target.symbol, "JNI_DefineClass");
                Ok(InstalledRedirect::new(
                    0xdead_0000,
                    host_define as DefineClassFn,
                    vec![0x55, 0x48, 0x89, 0xe5, 0x90],
                ))
            }
        }
    }

    fn restore(&self, _installed: &InstalledRedirect) -> Result<()> {
        self.counters.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CountingRuntime {
    issued: AtomicUsize,
    released: Arc<Mutex<Vec<ClassHandle>>>,
}

impl HostRuntime for CountingRuntime {
    fn new_global_ref(&self, _env: EnvHandle, _class: jclass) -> Option<ClassHandle> {
        let id = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        unsafe { ClassHandle::from_raw((id * 16) as jclass) }
    }

    fn delete_global_ref(&self, _env: EnvHandle, class: ClassHandle) {
        self.released.lock().unwrap().push(class);
    }

    fn version(&self, _env: EnvHandle) -> Option<jint> {
        Some(0x0015_0000)
    }
}

fn env() -> EnvHandle {
    unsafe { EnvHandle::from_raw(NonNull::<JNIEnv>::dangling().as_ptr()) }.unwrap()
}

fn setup() -> (Arc<Engine>, Arc<Counters>) {
    setup_with(EngineConfig::default(), None)
}

fn setup_with(config: EngineConfig, fail_with: Option<Error>) -> (Arc<Engine>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let engine = Engine::with_backends(
        config,
        Box::new(RecordingRedirector {
            counters: counters.clone(),
            fail_with,
        }),
        Box::new(CountingRuntime::default()),
    );
    (engine, counters)
}

fn load(engine: &Engine, name: &CStr, bytes: &[u8]) -> jclass {
    engine.define_class(DefineRequest::new(env(), Some(name), ptr::null_mut(), bytes))
}

fn appending(name: &str, byte: u8) -> Transform {
    Transform::new(name, move |_, bytes| {
        let mut out = bytes.to_vec();
        out.push(byte);
        RewriteResult::Rewritten(out)
    })
}

#[test]
fn test_marker_transform_end_to_end() -> Result<()> {
    let (engine, _) = setup();
    assert!(engine.init(Some(env()), None).is_patched());

    engine.add_transformer(appending("marker", 0xFF))?;

    let loads = Arc::new(Mutex::new(Vec::new()));
    let seen = loads.clone();
    engine.set_event_notification_mode(
        true,
        EventKind::ClassLoad,
        Some(Arc::new(move |class: &str| seen.lock().unwrap().push(class.to_string()))),
    )?;

    let before = engine.loaded_classes().len();
    let defined = load(&engine, c"com/example/Foo", &[0x01, 0x02]);

    assert!(!defined.is_null());
    assert_eq!(
        take_defined(),
        [("com/example/Foo".to_string(), vec![0x01, 0x02, 0xFF])]
    );
    assert_eq!(engine.loaded_classes().len(), before + 1);
    assert_eq!(*loads.lock().unwrap(), ["com/example/Foo"]);

    Ok(())
}

#[test]
fn test_init_twice_installs_once() {
    let (engine, counters) = setup();

    let first = engine.init(Some(env()), None);
    let second = engine.init(Some(env()), None);

    assert!(first.is_patched());
    assert!(second.is_patched());
    assert_eq!(counters.installs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transforms_compose_in_order_after_hooks() -> Result<()> {
    let (engine, _) = setup();
    engine.init(None, None);

    engine.add_transformer(appending("t1", 0x10))?;
    engine.add_transformer(appending("t2", 0x20))?;
    engine.add_method_hook(MethodHook::new("a/B", "m1", "()V", |_, bytes| {
        let mut out = bytes.to_vec();
        out.push(0x01);
        RewriteResult::Rewritten(out)
    }))?;
    engine.add_transformer(appending("t3", 0x30))?;
    engine.add_method_hook(MethodHook::new("a/B", "m2", "()V", |_, bytes| {
        let mut out = bytes.to_vec();
        out.push(0x02);
        RewriteResult::Rewritten(out)
    }))?;

    load(&engine, c"a/B", &[0x00]);
    assert_eq!(take_defined()[0].1, [0x00, 0x01, 0x02, 0x10, 0x20, 0x30]);

    Ok(())
}

#[test]
fn test_hook_never_runs_for_other_class() -> Result<()> {
    let (engine, _) = setup();
    engine.init(None, None);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine.add_method_hook(MethodHook::new("pkg/A", "run", "()V", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        RewriteResult::Unchanged
    }))?;

    for name in [c"pkg/B", c"pkg/AA", c"PKG/A", c"pkg/A$1"] {
        load(&engine, name, &[0x01]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    load(&engine, c"pkg/A", &[0x01]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[test]
fn test_failing_transform_is_isolated() -> Result<()> {
    let (engine, _) = setup();
    engine.init(None, None);

    let received = Arc::new(Mutex::new(Vec::new()));
    let seen = received.clone();
    engine.add_transformer(appending("first", 0x01))?;
    engine.add_transformer(Transform::new("broken", |_, _| {
        RewriteResult::Failed("cannot parse".into())
    }))?;
    engine.add_transformer(Transform::new("panicking", |_, _| panic!("bug in transform")))?;
    engine.add_transformer(Transform::new("observer", move |_, bytes| {
        seen.lock().unwrap().push(bytes.to_vec());
        RewriteResult::Unchanged
    }))?;

    let defined = load(&engine, c"a/B", &[0x00]);

    assert!(!defined.is_null());
    assert_eq!(*received.lock().unwrap(), [vec![0x00, 0x01]]);
    assert_eq!(take_defined()[0].1, [0x00, 0x01]);

    Ok(())
}

#[test]
fn test_loaded_classes_is_a_snapshot() {
    let (engine, _) = setup();
    engine.init(None, None);

    load(&engine, c"a/One", &[0x01]);
    let snapshot = engine.loaded_classes();
    assert_eq!(snapshot.len(), 1);

    load(&engine, c"a/Two", &[0x01]);
    load(&engine, c"a/Three", &[0x01]);

    assert_eq!(snapshot.len(), 1);
    assert_eq!(engine.loaded_classes().len(), 3);
    assert_eq!(engine.loaded_classes()[0], snapshot[0]);
}

#[test]
fn test_capabilities_snapshot() -> Result<()> {
    let (engine, _) = setup();
    engine.add_capabilities(&[0x1, 0x4])?;

    let snapshot = engine.capabilities();
    engine.add_capabilities(&[0x4, 0x8])?;

    assert_eq!(snapshot, [0x1, 0x4]);
    assert_eq!(engine.capabilities(), [0x1, 0x4, 0x8]);

    Ok(())
}

#[test]
fn test_rejected_class_is_not_cached() {
    let (engine, _) = setup();
    engine.init(None, None);

    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    engine.subscribe(EventKind::ClassLoad, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let defined = load(&engine, c"a/Bad", &[0xDE, 0xAD]);

    assert!(defined.is_null());
    assert!(engine.loaded_classes().is_empty());
    assert_eq!(loads.load(Ordering::SeqCst), 0);
}

#[test]
fn test_concurrent_registration() {
    const THREADS: u8 = 16;

    let (engine, _) = setup();
    engine.init(None, None);

    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine
                    .add_transformer(appending(&format!("t{id}"), id))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    load(&engine, c"a/B", &[]);
    let mut applied = take_defined().remove(0).1;
    assert_eq!(applied.len(), THREADS as usize);

    applied.sort_unstable();
    assert_eq!(applied, (0..THREADS).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_loads_are_all_recorded() {
    const THREADS: usize = 8;
    const LOADS: usize = 25;

    let (engine, _) = setup();
    engine.init(None, None);
    engine.add_transformer(appending("marker", 0xFF)).unwrap();

    let events = Arc::new(AtomicUsize::new(0));
    let counter = events.clone();
    engine.subscribe(EventKind::ClassLoad, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || {
                for _ in 0..LOADS {
                    assert!(!load(&engine, c"a/B", &[0x01]).is_null());
                }
                take_defined()
            })
        })
        .collect();

    for handle in handles {
        let defined = handle.join().unwrap();
        assert_eq!(defined.len(), LOADS);
        assert!(defined.iter().all(|(_, bytes)| bytes == &[0x01, 0xFF]));
    }

    assert_eq!(engine.loaded_classes().len(), THREADS * LOADS);
    assert_eq!(events.load(Ordering::SeqCst), THREADS * LOADS);
}

#[test]
fn test_degraded_init_keeps_registries_usable() -> Result<()> {
    let (engine, counters) = setup_with(
        EngineConfig::default(),
        Some(Error::ModuleNotFound("libjvm.so".into())),
    );

    let outcome = engine.init(None, None);
    assert!(matches!(outcome, InitOutcome::Degraded(Error::ModuleNotFound(_))));
    assert!(engine.is_initialized());
    assert!(!engine.is_patched());

    engine.add_transformer(appending("t", 0x01))?;
    engine.add_capabilities(&[1])?;

    // No traffic reaches the engine, and direct calls cannot be delegated
    assert!(load(&engine, c"a/B", &[0x00]).is_null());
    assert!(take_defined().is_empty());

    engine.shutdown(Some(env()));
    assert_eq!(counters.restores.load(Ordering::SeqCst), 0);

    Ok(())
}

#[test]
fn test_passive_embedder_supplies_original() -> Result<()> {
    let (engine, counters) = setup_with(EngineConfig::passive().with_original(host_define), None);

    assert!(matches!(engine.init(None, None), InitOutcome::Passive));
    assert_eq!(counters.installs.load(Ordering::SeqCst), 0);

    engine.add_transformer(appending("t", 0x01))?;
    assert!(!load(&engine, c"a/B", &[0x00]).is_null());
    assert_eq!(take_defined(), [("a/B".to_string(), vec![0x00, 0x01])]);
    assert_eq!(engine.loaded_classes().len(), 1);

    // Rejections by the embedder's define function are not cached
    assert!(load(&engine, c"a/C", &[0xDE]).is_null());
    assert_eq!(engine.loaded_classes().len(), 1);

    Ok(())
}

#[test]
fn test_shutdown_and_reinit() -> Result<()> {
    let (engine, counters) = setup();

    let deaths = Arc::new(AtomicUsize::new(0));
    let counter = deaths.clone();
    engine.subscribe(EventKind::VmDeath, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    engine.init(Some(env()), None);
    engine.add_transformer(appending("t", 0x01))?;
    load(&engine, c"a/B", &[0x00]);
    take_defined();

    engine.shutdown(Some(env()));
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
    assert_eq!(counters.restores.load(Ordering::SeqCst), 1);
    assert!(engine.loaded_classes().is_empty());

    assert!(engine.init(Some(env()), None).is_patched());
    assert_eq!(counters.installs.load(Ordering::SeqCst), 2);

    // Transforms from the previous cycle were cleared
    load(&engine, c"a/B", &[0x00]);
    assert_eq!(take_defined()[0].1, [0x00]);

    Ok(())
}

#[test]
fn test_unload_events_are_posted_by_embedder() {
    let (engine, _) = setup();
    let unloaded = Arc::new(Mutex::new(Vec::new()));
    let seen = unloaded.clone();
    engine.subscribe(EventKind::ClassUnload, move |class| {
        seen.lock().unwrap().push(class.to_string())
    });

    engine.init(None, None);
    load(&engine, c"a/B", &[0x01]);
    assert!(unloaded.lock().unwrap().is_empty());

    assert!(engine.post_event(EventKind::ClassUnload, "a/B"));
    assert_eq!(*unloaded.lock().unwrap(), ["a/B"]);
}

#[test]
fn test_version_passthrough() {
    let (engine, _) = setup();
    assert_eq!(engine.version(env()), Some(0x0015_0000));
}

#[test]
fn test_standalone_pipeline_reports_failures() {
    let mut registry = Registry::new();
    registry.add_method_hook(MethodHook::new("a/B", "run", "()V", |_, _| {
        RewriteResult::Failed("method not found".into())
    }));
    registry.add_transform(appending("t", 0x01));

    let output = TransformPipeline::new(true).apply(&registry, "a/B", vec![0x00]);

    assert_eq!(output.bytes, [0x00, 0x01]);
    assert_eq!(output.rewrites, 1);
    assert_eq!(output.failures.len(), 1);
    assert_eq!(output.failures[0].stage, Stage::MethodHook);
    assert_eq!(output.failures[0].name, "a/B.run()V");
    assert_eq!(output.failures[0].reason, "method not found");
}
