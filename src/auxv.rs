//! ELF auxiliary vector builder
//!
//! A libc whose bootstrap is driven from inside another process still expects
//! the auxiliary vector the kernel would normally put on the stack. This
//! module builds the minimal vector a musl/glibc-class runtime needs: clock
//! tick rate, hardware capability words, page size, platform string, and 16
//! random bytes when the kernel provides them.

use std::ptr;

// Auxiliary vector entry types (asm/auxvec.h)
const AT_NULL: u64 = 0;
const AT_PAGESZ: u64 = 6;
const AT_PLATFORM: u64 = 15;
const AT_HWCAP: u64 = 16;
const AT_CLKTCK: u64 = 17;
const AT_RANDOM: u64 = 25;
const AT_HWCAP2: u64 = 26;

/// Number of entries written (including the terminating null entry)
const NUM_ENTRIES: usize = 7;
/// Size of one entry: type and value, both 64-bit
const ENTRY_SIZE: usize = 2 * 8;
/// Number of random bytes backing the AT_RANDOM entry
const NUM_RANDOM_BYTES: usize = 16;

/// Size of the vector written by `write_aux_vec`
pub const fn aux_vec_size() -> usize {
    NUM_ENTRIES * ENTRY_SIZE + NUM_RANDOM_BYTES
}

/// Write an auxiliary vector suitable for bootstrapping a libc into `out`.
/// When `out` is not 8-byte aligned the vector is staged in an aligned
/// scratch buffer and copied.
pub fn write_aux_vec(out: &mut [u8]) {
    assert!(out.len() >= aux_vec_size());

    let is_aligned = out.as_ptr() as usize % 8 == 0;
    let mut scratch = [0u64; aux_vec_size() / 8];

    let base = if is_aligned {
        out.as_mut_ptr()
    } else {
        scratch.as_mut_ptr() as *mut u8
    };

    // The random bytes live directly behind the entries; AT_RANDOM points at them.
    let random_ptr = unsafe { base.add(NUM_ENTRIES * ENTRY_SIZE) };
    let have_random_bytes = unsafe {
        libc::getrandom(random_ptr as *mut libc::c_void, NUM_RANDOM_BYTES, 0)
            == NUM_RANDOM_BYTES as isize
    };

    let mut cursor = base as *mut u64;
    let mut push = |entry_type: u64, value: u64| unsafe {
        ptr::write(cursor, entry_type);
        ptr::write(cursor.add(1), value);
        cursor = cursor.add(2);
    };

    unsafe {
        push(AT_CLKTCK, libc::getauxval(AT_CLKTCK));
        push(AT_HWCAP, libc::getauxval(AT_HWCAP));
        push(AT_HWCAP2, libc::getauxval(AT_HWCAP2));
        push(AT_PAGESZ, libc::getauxval(AT_PAGESZ));
        push(AT_PLATFORM, libc::getauxval(AT_PLATFORM));
    }
    if have_random_bytes {
        push(AT_RANDOM, random_ptr as u64);
    }
    push(AT_NULL, 0);

    if !is_aligned {
        unsafe {
            ptr::copy_nonoverlapping(scratch.as_ptr() as *const u8, out.as_mut_ptr(), aux_vec_size())
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(buf: &[u8]) -> Vec<(u64, u64)> {
        let mut result = Vec::new();
        for chunk in buf[..NUM_ENTRIES * ENTRY_SIZE].chunks_exact(ENTRY_SIZE) {
            let entry_type = u64::from_ne_bytes(chunk[..8].try_into().unwrap());
            let value = u64::from_ne_bytes(chunk[8..].try_into().unwrap());
            result.push((entry_type, value));
            if entry_type == AT_NULL {
                break;
            }
        }
        result
    }

    #[test]
    fn vector_is_null_terminated() {
        let mut buf = vec![0u8; aux_vec_size()];
        write_aux_vec(&mut buf);
        let entries = entries(&buf);
        assert_eq!(entries.last(), Some(&(AT_NULL, 0)));
        assert!(entries.iter().any(|&(t, _)| t == AT_PAGESZ));
        assert!(entries.iter().any(|&(t, _)| t == AT_CLKTCK));
    }

    #[test]
    fn page_size_matches_the_system() {
        let mut buf = vec![0u8; aux_vec_size()];
        write_aux_vec(&mut buf);
        let page_size = entries(&buf)
            .into_iter()
            .find(|&(t, _)| t == AT_PAGESZ)
            .map(|(_, v)| v)
            .unwrap();
        assert_eq!(page_size, unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64);
    }

    #[test]
    fn misaligned_output_is_staged() {
        let mut buf = vec![0u8; aux_vec_size() + 1];
        // Force a misaligned view
        let view = if buf.as_ptr() as usize % 8 == 0 {
            &mut buf[1..]
        } else {
            let len = buf.len() - 1;
            &mut buf[..len]
        };
        write_aux_vec(view);
        assert_eq!(entries(view).last(), Some(&(AT_NULL, 0)));
    }
}
