//! Linking and execution of a compiled UDO
//!
//! Owns the callback functor block (its address is linked into the image,
//! so it lives behind a stable allocation), drives the in-process linker,
//! and hands out the typed entry points after initialization.

use std::ffi::{c_char, c_int, c_void};
use std::mem;

use crate::auxv;
use crate::error::{UdoError, UdoResult};
use crate::linker::Linker;
use crate::preprocess::{
    ACCEPT_NAME, CONSTRUCTOR_NAME, DESTRUCTOR_NAME, EXTRA_WORK_NAME, GLOBAL_CONSTRUCTOR_NAME,
    GLOBAL_DESTRUCTOR_NAME, PROCESS_NAME, THREAD_INIT_NAME,
};
use crate::settings::StringSetting;

static UDO_DEPS_PREFIX: StringSetting = StringSetting::new(
    "udoDepsPrefix",
    "Path to the sysroot with the static libraries linked into C++ UDOs",
    "/opt/udo-deps",
);

/// A callback installed by the host: function pointer plus state argument
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UdoFunctor {
    pub func: *mut c_void,
    pub state: *mut c_void,
}

impl Default for UdoFunctor {
    fn default() -> Self {
        UdoFunctor {
            func: std::ptr::null_mut(),
            state: std::ptr::null_mut(),
        }
    }
}

/// The functor block the compiled image indirects through. The linker binds
/// the three slot symbols to this storage, so the host can swap callbacks
/// between runs without relinking.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UdoFunctors {
    pub emit: UdoFunctor,
    pub print_debug: UdoFunctor,
    pub get_random: UdoFunctor,
}

/// emit callback: `(state, executionState0, executionState1, outputTuple)`
pub type EmitCallback =
    unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void, *const c_void);
/// printDebug callback: `(state, message, length)`
pub type PrintDebugCallback = unsafe extern "C" fn(*mut c_void, *const c_char, u64);
/// getRandom callback: `(state) -> u64`
pub type GetRandomCallback = unsafe extern "C" fn(*mut c_void) -> u64;

/// The allocation functions linked into the UDO, normally thunking into the
/// host's arena
#[derive(Debug, Clone, Copy)]
pub struct AllocationFns {
    pub malloc: unsafe extern "C" fn(usize) -> *mut c_void,
    pub calloc: unsafe extern "C" fn(usize, usize) -> *mut c_void,
    pub realloc: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
    pub posix_memalign: unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int,
    pub free: unsafe extern "C" fn(*mut c_void),
}

impl AllocationFns {
    /// The process allocator, for hosts without their own arena
    pub fn process_allocator() -> Self {
        AllocationFns {
            malloc: libc::malloc,
            calloc: libc::calloc,
            realloc: libc::realloc,
            posix_memalign: libc::posix_memalign,
            free: libc::free,
        }
    }
}

pub type GlobalConstructorFn = unsafe extern "C" fn(*mut c_void);
pub type GlobalDestructorFn = unsafe extern "C" fn();
pub type ThreadInitFn = unsafe extern "C" fn();
pub type ConstructorFn = unsafe extern "C" fn(*mut c_void, ...);
pub type DestructorFn = unsafe extern "C" fn(*mut c_void);
pub type AcceptFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void, *const c_void);
pub type ExtraWorkFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void, u32) -> u32;
pub type ProcessFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) -> u8;

/// The entry points of a linked UDO. A pointer is `None` when the user
/// class does not implement the corresponding member.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdoFunctions {
    pub global_constructor: Option<GlobalConstructorFn>,
    pub global_destructor: Option<GlobalDestructorFn>,
    pub thread_init: Option<ThreadInitFn>,
    pub constructor: Option<ConstructorFn>,
    pub destructor: Option<DestructorFn>,
    pub accept: Option<AcceptFn>,
    pub extra_work: Option<ExtraWorkFn>,
    pub process: Option<ProcessFn>,
}

/// The default archive set: the private libc/libc++ sysroot configured by
/// the `udoDepsPrefix` setting.
pub fn default_archives() -> Vec<String> {
    let prefix = UDO_DEPS_PREFIX.get();
    [
        "lib/libgcc.a",
        "lib/libgcc_eh.a",
        "lib/libm.a",
        "lib/libmvec.a",
        "lib/libc.a",
        "lib/libpthread.a",
        "lib/libc++abi.a",
        "lib/libc++.a",
    ]
    .iter()
    .map(|rel| format!("{}/{}", prefix, rel))
    .collect()
}

/// Link and execute a compiled UDO
pub struct UdoExecution {
    /// The compiled object bytes
    object: Vec<u8>,
    /// Functor storage; boxed so its address survives moves of the handle
    functors: Box<UdoFunctors>,
    linker: Option<Linker>,
    /// The argument block for the libc bootstrap, built on first use.
    /// Backed by u64 words so the block is 8-byte aligned.
    libc_arg: Option<Box<[u64]>>,
}

impl UdoExecution {
    pub fn new(object: Vec<u8>) -> Self {
        UdoExecution {
            object,
            functors: Box::default(),
            linker: None,
            libc_arg: None,
        }
    }

    /// Link the object against the archives and the predefined symbols
    pub fn link(
        &mut self,
        allocation_fns: AllocationFns,
        tls_block_offset: i64,
        tls_block_size: u64,
        archives: &[String],
    ) -> UdoResult<()> {
        let functors: *mut UdoFunctors = &mut *self.functors;
        let mut linker = Linker::new(allocation_fns, functors, tls_block_offset, tls_block_size);
        for path in archives {
            linker.add_archive(path)?;
        }
        linker.link_object(&self.object)?;
        self.linker = Some(linker);
        Ok(())
    }

    /// The functor block; the host installs its callbacks here
    pub fn functors(&mut self) -> &mut UdoFunctors {
        &mut self.functors
    }

    /// Restore the writable image state and the calling thread's TLS, then
    /// return the entry points.
    pub fn initialize(&mut self) -> UdoResult<UdoFunctions> {
        let linker = self
            .linker
            .as_ref()
            .ok_or_else(|| UdoError::link("UDO is not linked"))?;
        linker.initialize();

        fn lookup_fn<F: Copy>(linker: &Linker, name: &str) -> Option<F> {
            debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<u64>());
            linker
                .lookup(name)
                .filter(|&addr| addr != 0)
                .map(|addr| unsafe { mem::transmute_copy::<u64, F>(&addr) })
        }

        Ok(UdoFunctions {
            global_constructor: lookup_fn(linker, GLOBAL_CONSTRUCTOR_NAME),
            global_destructor: lookup_fn(linker, GLOBAL_DESTRUCTOR_NAME),
            thread_init: lookup_fn(linker, THREAD_INIT_NAME),
            constructor: lookup_fn(linker, CONSTRUCTOR_NAME),
            destructor: lookup_fn(linker, DESTRUCTOR_NAME),
            accept: lookup_fn(linker, ACCEPT_NAME),
            extra_work: lookup_fn(linker, EXTRA_WORK_NAME),
            process: lookup_fn(linker, PROCESS_NAME),
        })
    }

    /// The argument block passed to the generated global constructor:
    /// `{argc=1, argv}` followed by argv, envp, and the aux vector.
    pub fn libc_start_argument(&mut self) -> *mut c_void {
        if self.libc_arg.is_none() {
            self.libc_arg = Some(build_libc_start_argument());
        }
        self.libc_arg
            .as_mut()
            .expect("argument block built above")
            .as_mut_ptr() as *mut c_void
    }
}

static UDO_ARGV0: &[u8] = b"udo\0";

// argc+argv header, argv[2], envp[1], then the auxv
const HEADER_SIZE: usize = 16;
const ARGV_SIZE: usize = 2 * 8;
const ENVP_SIZE: usize = 8;

/// Build the `{int argc; char** argv}` block with the trailing argv, envp,
/// and auxv data libc expects. Backed by u64 words for alignment.
fn build_libc_start_argument() -> Box<[u64]> {
    let total = HEADER_SIZE + ARGV_SIZE + ENVP_SIZE + auxv::aux_vec_size();
    let words = total.div_ceil(8);
    let mut block = vec![0u64; words].into_boxed_slice();

    let base = block.as_mut_ptr() as *mut u8;
    let bytes = unsafe { std::slice::from_raw_parts_mut(base, words * 8) };

    // argc = 1, argv points just behind the header
    bytes[0..4].copy_from_slice(&1i32.to_ne_bytes());
    let argv_ptr = unsafe { base.add(HEADER_SIZE) };
    bytes[8..16].copy_from_slice(&(argv_ptr as u64).to_ne_bytes());

    // argv = {"udo", nullptr}; argv[1] and envp[0] stay null
    let argv0 = UDO_ARGV0.as_ptr() as u64;
    bytes[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&argv0.to_ne_bytes());

    let auxv_start = HEADER_SIZE + ARGV_SIZE + ENVP_SIZE;
    auxv::write_aux_vec(&mut bytes[auxv_start..]);

    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libc_start_argument_layout() {
        let block = build_libc_start_argument();
        let base = block.as_ptr() as u64;
        let bytes =
            unsafe { std::slice::from_raw_parts(block.as_ptr() as *const u8, block.len() * 8) };

        let argc = i32::from_ne_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(argc, 1);

        let argv = u64::from_ne_bytes(bytes[8..16].try_into().unwrap());
        assert_eq!(argv, base + 16);

        let argv0 = u64::from_ne_bytes(bytes[16..24].try_into().unwrap());
        let name = unsafe { std::ffi::CStr::from_ptr(argv0 as *const c_char) };
        assert_eq!(name.to_bytes(), b"udo");

        let argv1 = u64::from_ne_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(argv1, 0);
        let envp0 = u64::from_ne_bytes(bytes[32..40].try_into().unwrap());
        assert_eq!(envp0, 0);
    }

    #[test]
    fn functor_block_layout_matches_the_slots() {
        // The linker binds slot symbols at fixed offsets into the block
        assert_eq!(std::mem::size_of::<UdoFunctor>(), 16);
        let functors = UdoFunctors::default();
        let base = &functors as *const _ as usize;
        assert_eq!(&functors.emit as *const _ as usize - base, 0);
        assert_eq!(&functors.print_debug as *const _ as usize - base, 16);
        assert_eq!(&functors.get_random as *const _ as usize - base, 32);
    }
}
