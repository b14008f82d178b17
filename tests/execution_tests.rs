//! End-to-end compilation and execution of UDOs
//!
//! These tests run generated machine code, so they are confined to the one
//! target the runtime supports.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

mod common;

use std::ffi::c_void;

use udo_runtime::{AllocationFns, UdoHandle};

use common::{mini_libc, scratch_dir};

const DEMO_SOURCE: &str = r#"
    #include <udo/UDOperator.hpp>

    class Demo : public udo::UDOperator {
       int32_t stored = 0;

       public:
       struct InputTuple {
          int32_t x;
       };
       struct OutputTuple {
          int32_t y;
       };

       ~Demo() {
          stored = 0;
       }

       void accept(udo::ExecutionState state, const InputTuple& input) {
          stored = input.x;
       }

       bool process(udo::ExecutionState state) {
          emit<Demo>(state, OutputTuple{stored});
          return true;
       }
    };
"#;

#[repr(C)]
struct InputTuple {
    x: i32,
}

#[repr(C)]
struct OutputTuple {
    y: i32,
}

/// Collects every emitted y value
unsafe extern "C" fn collect_emit(
    state: *mut c_void,
    _es0: *mut c_void,
    _es1: *mut c_void,
    tuple: *const c_void,
) {
    let collected = unsafe { &mut *(state as *mut Vec<i32>) };
    let tuple = unsafe { &*(tuple as *const OutputTuple) };
    collected.push(tuple.y);
}

fn linked_demo(source: &str) -> UdoHandle {
    let dir = scratch_dir("execution");
    let libc_archive = mini_libc(&dir);

    let mut handle = UdoHandle::new(source, "Demo");
    handle.analyze().expect("analysis failed");
    handle.compile().expect("compilation failed");
    handle
        .link_with_archives(
            AllocationFns::process_allocator(),
            -65536,
            65536,
            &[libc_archive],
        )
        .expect("link failed");
    handle
}

#[test]
fn s1_accept_then_process_emits_the_stored_value() {
    let mut handle = linked_demo(DEMO_SOURCE);

    let args = handle.arguments().unwrap();
    assert!(args.has_table_arg);
    assert!(args.scalar.is_empty());
    let output = handle.output_attributes().unwrap();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].name, "y");

    let mut collected: Box<Vec<i32>> = Box::default();
    let constructor_arg = handle.constructor_arg().unwrap();
    let execution = handle.execution().unwrap();
    {
        let functors = execution.functors();
        functors.emit.func = collect_emit as *mut c_void;
        functors.emit.state = &mut *collected as *mut Vec<i32> as *mut c_void;
    }

    let functions = execution.initialize().unwrap();
    let global_constructor = functions.global_constructor.unwrap();
    let thread_init = functions.thread_init.unwrap();
    let constructor = functions.constructor.unwrap();
    let destructor = functions.destructor.unwrap();
    let accept = functions.accept.unwrap();
    let process = functions.process.unwrap();

    let mut object = vec![0u8; 16];
    let this = object.as_mut_ptr() as *mut c_void;
    let null = std::ptr::null_mut();

    unsafe {
        global_constructor(constructor_arg);
        thread_init();
        constructor(this);
        accept(this, null, null, &InputTuple { x: 7 } as *const _ as *const c_void);
        let produced = process(this, null, null);
        assert_eq!(produced, 1);
        destructor(this);
    }

    assert_eq!(collected.as_slice(), &[7]);
}

#[test]
fn s4_absent_lifecycle_members_yield_null_pointers() {
    let mut handle = linked_demo(DEMO_SOURCE);
    let functions = handle.execution().unwrap().initialize().unwrap();

    // Demo omits extraWork; everything else is implemented
    assert!(functions.extra_work.is_none());
    assert!(functions.global_constructor.is_some());
    assert!(functions.global_destructor.is_some());
    assert!(functions.thread_init.is_some());
    assert!(functions.constructor.is_some());
    assert!(functions.destructor.is_some());
    assert!(functions.accept.is_some());
    assert!(functions.process.is_some());
}

#[test]
fn repeated_runs_observe_identical_behavior() {
    let mut handle = linked_demo(DEMO_SOURCE);

    let mut collected: Box<Vec<i32>> = Box::default();
    let constructor_arg = handle.constructor_arg().unwrap();
    let execution = handle.execution().unwrap();
    {
        let functors = execution.functors();
        functors.emit.func = collect_emit as *mut c_void;
        functors.emit.state = &mut *collected as *mut Vec<i32> as *mut c_void;
    }

    let mut first_run = true;
    for _ in 0..3 {
        let functions = execution.initialize().unwrap();
        let constructor = functions.constructor.unwrap();
        let destructor = functions.destructor.unwrap();
        let accept = functions.accept.unwrap();
        let process = functions.process.unwrap();

        let mut object = vec![0u8; 16];
        let this = object.as_mut_ptr() as *mut c_void;
        let null = std::ptr::null_mut();

        unsafe {
            if first_run {
                (functions.global_constructor.unwrap())(constructor_arg);
                first_run = false;
            }
            (functions.thread_init.unwrap())();
            constructor(this);
            accept(this, null, null, &InputTuple { x: 31 } as *const _ as *const c_void);
            assert_eq!(process(this, null, null), 1);
            destructor(this);
        }
    }

    assert_eq!(collected.as_slice(), &[31, 31, 31]);
}

#[test]
fn extra_work_participates_in_the_pipeline() {
    let source = r#"
        #include <udo/UDOperator.hpp>

        class Batch : public udo::UDOperator {
           int64_t total = 0;

           public:
           struct InputTuple {
              int64_t v;
           };
           struct OutputTuple {
              int64_t sum;
           };

           void accept(udo::ExecutionState state, const InputTuple& input) {
              total += input.v;
           }

           uint32_t extraWork(udo::ExecutionState state, uint32_t step) {
              return step + 1;
           }

           bool process(udo::ExecutionState state) {
              emit<Batch>(state, OutputTuple{total});
              return true;
           }
        };
    "#;

    let dir = scratch_dir("extra-work");
    let libc_archive = mini_libc(&dir);

    let mut handle = UdoHandle::new(source, "Batch");
    handle.analyze().unwrap();
    handle.compile().unwrap();
    handle
        .link_with_archives(
            AllocationFns::process_allocator(),
            -65536,
            65536,
            &[libc_archive],
        )
        .unwrap();

    let constructor_arg = handle.constructor_arg().unwrap();
    let execution = handle.execution().unwrap();
    let functions = execution.initialize().unwrap();

    let extra_work = functions.extra_work.unwrap();
    let constructor = functions.constructor.unwrap();

    let mut object = vec![0u8; 16];
    let this = object.as_mut_ptr() as *mut c_void;
    let null = std::ptr::null_mut();

    unsafe {
        (functions.global_constructor.unwrap())(constructor_arg);
        (functions.thread_init.unwrap())();
        constructor(this);
        assert_eq!(extra_work(this, null, null, 41), 42);
    }
}

#[test]
fn constructor_arguments_are_forwarded() {
    let source = r#"
        #include <udo/UDOperator.hpp>

        class Seeded : public udo::UDOperator {
           int32_t seed;

           public:
           struct InputTuple {};
           struct OutputTuple {
              int32_t v;
           };

           Seeded(int32_t seed) : seed(seed) {}

           bool process(udo::ExecutionState state) {
              emit<Seeded>(state, OutputTuple{seed});
              return true;
           }
        };
    "#;

    let dir = scratch_dir("ctor-args");
    let libc_archive = mini_libc(&dir);

    let mut handle = UdoHandle::new(source, "Seeded");
    handle.analyze().unwrap();
    handle.compile().unwrap();
    handle
        .link_with_archives(
            AllocationFns::process_allocator(),
            -65536,
            65536,
            &[libc_archive],
        )
        .unwrap();

    let mut collected: Box<Vec<i32>> = Box::default();
    let constructor_arg = handle.constructor_arg().unwrap();
    let execution = handle.execution().unwrap();
    {
        let functors = execution.functors();
        functors.emit.func = collect_emit as *mut c_void;
        functors.emit.state = &mut *collected as *mut Vec<i32> as *mut c_void;
    }

    let functions = execution.initialize().unwrap();
    let constructor = functions.constructor.unwrap();
    let process = functions.process.unwrap();

    let mut object = vec![0u8; 16];
    let this = object.as_mut_ptr() as *mut c_void;
    let null = std::ptr::null_mut();

    unsafe {
        (functions.global_constructor.unwrap())(constructor_arg);
        (functions.thread_init.unwrap())();
        constructor(this, 1234i32);
        assert_eq!(process(this, null, null), 1);
    }
    assert_eq!(collected.as_slice(), &[1234]);
}
