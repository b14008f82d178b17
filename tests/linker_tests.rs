//! Linker behavior: symbol precedence, lazy member loading, TLS placement

mod common;

use udo_runtime::linker::Linker;
use udo_runtime::{AllocationFns, UdoFunctors};

use common::{archive_file, build_data_ref_object, build_object, scratch_dir, StubSymbol};

fn new_linker(functors: &mut UdoFunctors) -> Linker {
    Linker::new(AllocationFns::process_allocator(), functors, -65536, 65536)
}

/// Read the 8-byte probe slot a linked object placed for `name`
fn read_probe(linker: &Linker, name: &str) -> u64 {
    let addr = linker.lookup(name).expect("probe symbol not linked");
    unsafe { std::ptr::read(addr as *const u64) }
}

#[test]
fn predefined_symbols_win_over_archives() {
    let dir = scratch_dir("predefined");
    // The archive also defines malloc; the predefined binding must win
    let decoy = build_object(
        &[0xc3],
        &[],
        &[StubSymbol::func("malloc", 0, 1)],
        &[],
    );
    let archive = archive_file(&dir, "decoy.a", &[("decoy.o", &decoy)]);

    let mut functors = UdoFunctors::default();
    let mut linker = new_linker(&mut functors);
    linker.add_archive(&archive).unwrap();

    let object = build_data_ref_object(&[("probe_malloc", "malloc", false)]);
    linker.link_object(&object).unwrap();

    assert_eq!(read_probe(&linker, "probe_malloc"), libc::malloc as usize as u64);
}

#[test]
fn global_definitions_supersede_weak_ones() {
    let dir = scratch_dir("precedence");
    let weak_def = build_object(
        &[],
        &[0x11; 8],
        &[],
        &[StubSymbol::data("shared_value", 0, 8).weak()],
    );
    let strong_def = build_object(
        &[],
        &[0x22; 8],
        &[],
        &[StubSymbol::data("shared_value", 0, 8)],
    );
    let archive = archive_file(
        &dir,
        "precedence.a",
        &[("weak.o", &weak_def), ("strong.o", &strong_def)],
    );

    let mut functors = UdoFunctors::default();
    let mut linker = new_linker(&mut functors);
    linker.add_archive(&archive).unwrap();

    let object = build_data_ref_object(&[("probe_shared", "shared_value", false)]);
    linker.link_object(&object).unwrap();

    let resolved = read_probe(&linker, "probe_shared");
    let value = unsafe { std::ptr::read(resolved as *const u64) };
    assert_eq!(value, 0x2222_2222_2222_2222);
}

#[test]
fn weak_definitions_are_used_when_nothing_stronger_exists() {
    let dir = scratch_dir("weak-def");
    let weak_def = build_object(
        &[],
        &[0x33; 8],
        &[],
        &[StubSymbol::data("weak_only", 0, 8).weak()],
    );
    let archive = archive_file(&dir, "weak.a", &[("weak.o", &weak_def)]);

    let mut functors = UdoFunctors::default();
    let mut linker = new_linker(&mut functors);
    linker.add_archive(&archive).unwrap();

    let object = build_data_ref_object(&[("probe_weak", "weak_only", false)]);
    linker.link_object(&object).unwrap();

    let resolved = read_probe(&linker, "probe_weak");
    let value = unsafe { std::ptr::read(resolved as *const u64) };
    assert_eq!(value, 0x3333_3333_3333_3333);
}

#[test]
fn undefined_weak_resolves_to_zero() {
    let mut functors = UdoFunctors::default();
    let mut linker = new_linker(&mut functors);

    let object = build_data_ref_object(&[("probe_missing", "never_defined_anywhere", true)]);
    linker.link_object(&object).unwrap();

    assert_eq!(read_probe(&linker, "probe_missing"), 0);
}

#[test]
fn unknown_symbols_name_the_missing_symbol() {
    let mut functors = UdoFunctors::default();
    let mut linker = new_linker(&mut functors);

    let object = build_data_ref_object(&[("probe", "definitely_missing_symbol", false)]);
    let err = linker.link_object(&object).unwrap_err();
    assert!(err.message().contains("definitely_missing_symbol"));
}

#[test]
fn unreferenced_members_are_never_loaded() {
    let dir = scratch_dir("lazy");
    let wanted = build_object(
        &[],
        &[0x44; 8],
        &[],
        &[StubSymbol::data("wanted_symbol", 0, 8)],
    );
    // This member could never link: it strongly references a symbol that
    // exists nowhere. The link can only succeed if it stays unloaded.
    let poisoned = build_data_ref_object(&[("poison_probe", "missing_everywhere", false)]);
    let archive = archive_file(
        &dir,
        "lazy.a",
        &[("wanted.o", &wanted), ("poisoned.o", &poisoned)],
    );

    let mut functors = UdoFunctors::default();
    let mut linker = new_linker(&mut functors);
    linker.add_archive(&archive).unwrap();

    let object = build_data_ref_object(&[("probe_wanted", "wanted_symbol", false)]);
    linker.link_object(&object).unwrap();

    let resolved = read_probe(&linker, "probe_wanted");
    let value = unsafe { std::ptr::read(resolved as *const u64) };
    assert_eq!(value, 0x4444_4444_4444_4444);
}

#[test]
fn repeated_archives_are_opened_once() {
    let dir = scratch_dir("repeat");
    let member = build_object(&[], &[0u8; 8], &[], &[StubSymbol::data("repeat_sym", 0, 8)]);
    let archive = archive_file(&dir, "repeat.a", &[("m.o", &member)]);

    let mut functors = UdoFunctors::default();
    let mut linker = new_linker(&mut functors);
    linker.add_archive(&archive).unwrap();
    linker.add_archive(&archive).unwrap();

    let object = build_data_ref_object(&[("probe_repeat", "repeat_sym", false)]);
    linker.link_object(&object).unwrap();
}

#[test]
fn missing_archives_surface_their_path() {
    let mut functors = UdoFunctors::default();
    let mut linker = new_linker(&mut functors);
    let err = linker.add_archive("/no/such/place/libx.a").unwrap_err();
    assert!(err.message().contains("/no/such/place/libx.a"));
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod native {
    use super::*;
    use common::build_tls_object;
    use std::cell::RefCell;

    fn thread_pointer() -> *mut u8 {
        let tp: *mut u8;
        unsafe {
            std::arch::asm!(
                "mov {}, qword ptr fs:[0]",
                out(reg) tp,
                options(nostack, preserves_flags)
            );
        }
        tp
    }

    #[test]
    fn tls_sections_land_in_the_dynamic_block() {
        thread_local! {
            static BLOCK: RefCell<[u8; 256]> = const { RefCell::new([0u8; 256]) };
        }

        BLOCK.with(|block| {
            let block_ptr = block.borrow_mut().as_mut_ptr();
            let block_offset = block_ptr as i64 - thread_pointer() as i64;

            let mut functors = UdoFunctors::default();
            let mut linker = Linker::new(
                AllocationFns::process_allocator(),
                &mut functors,
                block_offset,
                256,
            );

            let object = build_tls_object("tls_counter", &0x1234_5678u64.to_le_bytes(), "read_tls");
            linker.link_object(&object).unwrap();
            linker.initialize();

            let reader = linker.lookup("read_tls").expect("reader not linked");
            let reader: unsafe extern "C" fn() -> u32 =
                unsafe { std::mem::transmute(reader as usize) };
            assert_eq!(unsafe { reader() }, 0x1234_5678);
        });
    }

    /// The unwinder's `_dl_find_object` lookup reports "unknown" instead of
    /// aborting the process
    #[test]
    fn dl_find_object_fallback_returns_unknown() {
        let mut functors = UdoFunctors::default();
        let mut linker = new_linker(&mut functors);

        let object = build_data_ref_object(&[("probe_dlfo", "_dl_find_object", false)]);
        linker.link_object(&object).unwrap();

        let stub = read_probe(&linker, "probe_dlfo");
        assert_ne!(stub, 0);
        let stub: unsafe extern "C" fn(*mut std::ffi::c_void, *mut std::ffi::c_void) -> i32 =
            unsafe { std::mem::transmute(stub as usize) };
        let result = unsafe { stub(std::ptr::null_mut(), std::ptr::null_mut()) };
        assert_eq!(result, -1);
    }
}
