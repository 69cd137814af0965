//! Integration tests for backend selection, async initialisation, data
//! migration between backends and kernel leak detection.

use std::cell::Cell;
use std::rc::Rc;

use futures::executor::block_on;
use tr_backend_cpu::{
    register_cpu_backend, register_cpu_backend_named, register_cpu_kernels, CpuBackend,
};
use tr_ops::{add, mul, tensor};
use tr_tensor::prelude::*;
use tr_tensor::{input, BackendState, KernelArgs, TensorInfo};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pending_cpu(name: &'static str) -> impl Fn() -> Result<BackendInit> {
    move || {
        Ok(BackendInit::Pending(Box::pin(async move {
            Ok(Box::new(CpuBackend::new(name)) as Box<dyn Backend>)
        })))
    }
}

// ============================================================================
// Test: Priority Selection and Fallback
// ============================================================================

#[test]
fn test_fallback_skips_failing_backend() {
    init_logging();
    let mut e = Engine::new();
    let observed_broken = Rc::new(Cell::new(false));

    e.register_backend("broken", || Err(Error::Backend("no device".into())), 10);
    let flag = observed_broken.clone();
    e.register_kernel(KernelConfig::new("Add", "broken", move |_args: KernelArgs<'_>| {
        flag.set(true);
        Ok(Vec::new())
    }));
    register_cpu_backend(&mut e, 5);
    assert_eq!(e.registry_backend_names(), vec!["broken".to_string(), "cpu".to_string()]);

    let a = tensor(&mut e, &[1.0, 2.0, 3.0], [3]).unwrap();
    let b = add(&mut e, &a, &a).unwrap();

    assert_eq!(e.read_f32(&b).unwrap(), vec![2.0, 4.0, 6.0]);
    assert_eq!(e.backend_name(), Some("cpu"));
    assert_eq!(e.backend_state("broken"), Some(BackendState::Failed));
    assert!(e.find_backend("broken").is_none());
    assert!(!observed_broken.get());
}

#[test]
fn test_highest_priority_wins() {
    let mut e = Engine::new();
    register_cpu_backend_named(&mut e, "low", 1);
    register_cpu_backend_named(&mut e, "high", 3);
    assert!(!register_cpu_backend_named(&mut e, "high", 7));

    e.backend().unwrap();
    assert_eq!(e.backend_name(), Some("high"));
    assert!(e.find_backend("low").is_none());
    assert!(e.find_backend_factory("low").is_some());
}

#[test]
fn test_no_backend_available() {
    let mut e = Engine::new();
    assert!(matches!(
        tensor(&mut e, &[1.0], [1]),
        Err(Error::NoBackendAvailable)
    ));

    e.register_backend("broken", || Err(Error::Backend("no device".into())), 1);
    assert!(matches!(e.backend(), Err(Error::NoBackendAvailable)));
}

#[test]
fn test_unknown_kernel_and_backend() {
    let mut e = Engine::new();
    register_cpu_backend(&mut e, 1);
    let a = tensor(&mut e, &[1.0], [1]).unwrap();

    let err = e
        .run_kernel("Conv2D", &named([("x", &a)]), &Attrs::new())
        .unwrap_err();
    assert!(matches!(err, Error::KernelNotFound { .. }));
    assert!(matches!(
        block_on(e.set_backend("webgl")),
        Err(Error::BackendNotFound(_))
    ));
}

// ============================================================================
// Test: Asynchronous Initialisation
// ============================================================================

#[test]
fn test_async_backend_needs_ready() {
    init_logging();
    let mut e = Engine::new();
    e.register_backend("gpu", pending_cpu("gpu"), 10);
    register_cpu_kernels(&mut e, "gpu");

    assert!(matches!(
        tensor(&mut e, &[1.0], [1]),
        Err(Error::BackendNotReady(name)) if name == "gpu"
    ));
    assert_eq!(e.backend_state("gpu"), Some(BackendState::Initializing));

    block_on(e.ready()).unwrap();
    assert_eq!(e.backend_name(), Some("gpu"));
    let a = tensor(&mut e, &[1.0, 2.0], [2]).unwrap();
    let b = mul(&mut e, &a, &a).unwrap();
    assert_eq!(block_on(e.read(&b)).unwrap(), TensorValues::F32(vec![1.0, 4.0]));
}

#[test]
fn test_stale_initialisation_is_discarded() {
    init_logging();
    let mut e = Engine::new();
    e.register_backend("slow", pending_cpu("slow"), 10);
    register_cpu_kernels(&mut e, "slow");
    register_cpu_backend(&mut e, 1);

    assert!(matches!(e.backend(), Err(Error::BackendNotReady(_))));

    // Switching explicitly supersedes the in-flight initialisation.
    assert!(block_on(e.set_backend("cpu")).unwrap());
    let a = tensor(&mut e, &[3.0], [1]).unwrap();
    assert_eq!(e.read_f32(&a).unwrap(), vec![3.0]);

    block_on(e.ready()).unwrap();
    assert_eq!(e.backend_name(), Some("cpu"));
    assert!(e.find_backend("slow").is_none());
    assert_eq!(e.backend_state("slow"), Some(BackendState::Registered));

    // The superseded backend can still be chosen later.
    assert!(block_on(e.set_backend("slow")).unwrap());
    assert_eq!(e.backend_name(), Some("slow"));
}

#[test]
fn test_set_backend_reports_failed_init() {
    let mut e = Engine::new();
    register_cpu_backend(&mut e, 1);
    e.register_backend("broken", || Err(Error::Backend("no device".into())), 0);

    assert!(!block_on(e.set_backend("broken")).unwrap());
    assert_eq!(e.backend_state("broken"), Some(BackendState::Failed));
}

// ============================================================================
// Test: Data Migration
// ============================================================================

#[test]
fn test_kernel_inputs_migrate_to_active_backend() {
    init_logging();
    let mut e = Engine::with_config(EngineConfig::default().with_check_leaks(true));
    register_cpu_backend_named(&mut e, "first", 2);
    register_cpu_backend_named(&mut e, "second", 1);

    let a = tensor(&mut e, &[1.0, 2.0, 3.0], [3]).unwrap();
    let alias = tr_ops::clone(&mut e, &a).unwrap();
    assert_eq!(e.backend_name(), Some("first"));

    assert!(block_on(e.set_backend("second")).unwrap());
    let b = add(&mut e, &a, &a).unwrap();

    assert_eq!(e.read_f32(&b).unwrap(), vec![2.0, 4.0, 6.0]);
    assert_eq!(e.find_backend("first").unwrap().num_data_ids(), 0);
    let second = e.find_backend("second").unwrap();
    assert_eq!(second.num_data_ids(), 2);
    // Both handles moved along with the data.
    assert_eq!(second.ref_count(a.data_id()), 2);
    assert_eq!(e.read_f32(&alias).unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(e.num_data_buffers(), 2);
}

#[test]
fn test_explicit_move_and_backend_removal() {
    let mut e = Engine::new();
    register_cpu_backend_named(&mut e, "first", 2);
    register_cpu_backend_named(&mut e, "second", 1);
    let a = tensor(&mut e, &[1.0], [1]).unwrap();
    block_on(e.set_backend("second")).unwrap();

    assert!(e.move_data("second", a.data_id()).unwrap());
    assert!(!e.move_data("second", a.data_id()).unwrap());
    assert_eq!(e.read_f32(&a).unwrap(), vec![1.0]);

    assert_eq!(e.num_bytes(), 4);

    e.remove_backend("second");
    assert!(e.backend_name().is_none());
    assert!(!e.has_data(a.data_id()));
    assert_eq!(e.num_bytes(), 0);
    assert_eq!(e.num_data_buffers(), 0);
    assert_eq!(e.registry_backend_names(), vec!["first".to_string()]);
    // Disposing a handle whose owner is gone is harmless.
    e.dispose_tensor(&a).unwrap();
    assert_eq!(e.num_tensors(), 0);
    assert_eq!(e.num_bytes(), 0);
}

// ============================================================================
// Test: Leak Detection
// ============================================================================

fn register_leaky_kernel(e: &mut Engine) {
    e.register_kernel(KernelConfig::new("Leaky", "cpu", |args: KernelArgs<'_>| {
        let x = input(args.inputs, "x")?;
        let values = args.backend.read_sync(x.data_id())?;
        // Scratch buffer that is never released.
        args.backend
            .write(TensorValues::F32(vec![0.0]), &Shape::from([1]), DType::Float32)?;
        let data_id = args.backend.write(values, x.shape(), x.dtype())?;
        Ok(vec![TensorInfo::new(data_id, x.shape().clone(), x.dtype())])
    }));
}

#[test]
fn test_leaky_kernel_is_detected() {
    let mut e = Engine::with_config(EngineConfig::default().with_check_leaks(true));
    register_cpu_backend(&mut e, 1);
    register_leaky_kernel(&mut e);
    let a = tensor(&mut e, &[1.0, 2.0], [2]).unwrap();

    let err = e
        .run_kernel("Leaky", &named([("x", &a)]), &Attrs::new())
        .unwrap_err();
    assert!(matches!(err, Error::MemoryLeak { leaked: 1, .. }));

    // Well-behaved kernels pass the same check.
    assert!(add(&mut e, &a, &a).is_ok());
}

#[test]
fn test_leak_check_is_opt_in() {
    let mut e = Engine::new();
    register_cpu_backend(&mut e, 1);
    register_leaky_kernel(&mut e);
    let a = tensor(&mut e, &[1.0, 2.0], [2]).unwrap();

    let out = e
        .run_kernel("Leaky", &named([("x", &a)]), &Attrs::new())
        .unwrap();
    assert_eq!(e.read_f32(&out).unwrap(), vec![1.0, 2.0]);
}

// ============================================================================
// Test: Kernel Hooks
// ============================================================================

#[test]
fn test_setup_and_dispose_hooks_run_per_backend() {
    let mut e = Engine::new();
    let setups = Rc::new(Cell::new(0));
    let disposals = Rc::new(Cell::new(0));
    register_cpu_backend(&mut e, 1);

    let (s, d) = (setups.clone(), disposals.clone());
    e.register_kernel(
        KernelConfig::new("Noop", "cpu", |_args: KernelArgs<'_>| Ok(Vec::new()))
            .with_setup(move |_backend| s.set(s.get() + 1))
            .with_dispose(move |_backend| d.set(d.get() + 1)),
    );
    assert_eq!(e.get_kernels_for_backend("cpu").len(), 13);

    e.backend().unwrap();
    assert_eq!(setups.get(), 1);
    e.remove_backend("cpu");
    assert_eq!(disposals.get(), 1);
    assert!(e.get_kernel("Noop", "cpu").is_some());
    e.unregister_kernel("Noop", "cpu").unwrap();
    assert!(e.get_kernel("Noop", "cpu").is_none());
}
