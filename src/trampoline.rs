//! The trampoline (spec.md §6): builds the initial stack and transfers
//! control to the target's entry point.
//!
//! This is "thin glue" per spec.md §1: its job is only to make sure the
//! target's first instruction is fetched, which triggers the first page
//! fault and kicks off demand paging. Grounded in the teacher's
//! `loader::stack_builder` (stack layout) and `loader::mod` (the argv/argc
//! calling-convention diagram), adapted from a page-table-backed stack to a
//! directly `mmap`'d one since there is no kernel-side page table here.

use std::ffi::CString;

/// Top of the stack region, matching the teacher's fixed user stack top.
/// The stack grows downward from here.
const STACK_TOP: usize = 0x4748_0000;
const STACK_SIZE: usize = 0x10_0000;

/// Builds the argv vector and process stack, then jumps to `entry`. Does
/// not return on success (spec.md §4.5 step 5): control passes to the
/// target program, which eventually calls `exit`.
///
/// # Safety
/// `entry` must be a valid entry point within a segment whose first page
/// has already been (or will be, via a fault as this jump lands) mapped
/// executable by the fault handler.
pub unsafe fn start(entry: usize, argv: &[String]) -> ! {
    // Safety: a fixed-address anonymous mapping for the stack, placed well
    // below any statically linked binary's typical load address and away
    // from the segments the fault handler owns.
    let stack_base = unsafe {
        libc::mmap(
            (STACK_TOP - STACK_SIZE) as *mut libc::c_void,
            STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    assert_ne!(stack_base, libc::MAP_FAILED, "failed to map the initial stack");

    let mut sp = STACK_TOP;

    // Push argument strings (order does not matter) and record their
    // addresses, mirroring the teacher's `push_str`/pointer-table scheme.
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for arg in argv {
        let c = CString::new(arg.as_str()).expect("argv entry contains a NUL byte");
        let bytes = c.as_bytes_with_nul();
        sp -= bytes.len();
        // Safety: `sp` remains within the freshly mapped stack region for
        // every iteration, since the total pushed bytes are bounded by
        // `STACK_SIZE` for any reasonable argv.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), sp as *mut u8, bytes.len());
        }
        argv_ptrs.push(sp);
    }

    // Align to 8 bytes before the pointer table, per the System V x86-64
    // calling convention the teacher's diagram documents.
    sp &= !0x7;

    // NULL sentinel, then argv pointers in reverse, then a bogus return
    // address so a stray `ret` from `main` does not escape the mapped
    // region silently.
    sp -= std::mem::size_of::<usize>();
    unsafe {
        std::ptr::write(sp as *mut usize, 0);
    }
    for &ptr in argv_ptrs.iter().rev() {
        sp -= std::mem::size_of::<usize>();
        unsafe {
            std::ptr::write(sp as *mut usize, ptr);
        }
    }
    let argv_base = sp;

    sp -= std::mem::size_of::<usize>();
    unsafe {
        std::ptr::write(sp as *mut usize, 0); // bogus return address
    }

    let argc = argv.len();

    // Safety: `entry` and `sp` are valid per this function's contract; this
    // never returns because it overwrites `rip`/`rsp` and jumps directly.
    unsafe {
        std::arch::asm!(
            "mov rsp, {sp}",
            "jmp {entry}",
            sp = in(reg) sp,
            entry = in(reg) entry,
            in("rdi") argc,
            in("rsi") argv_base,
            options(noreturn),
        )
    }
}
