// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! ## Suspended frame layout
//!
//! A suspended context is identified by its stack pointer, which points at a
//! three-word frame holding the callee-saved registers LLVM reserves (RBX and
//! RBP must be spilled by hand; the remaining callee-saved registers are
//! declared as clobbers so the compiler spills only what is live):
//!
//! ```text
//! +------------+
//! | Resume RIP |  [sp + 16]
//! +------------+
//! | Saved RBP  |  [sp + 8]
//! +------------+
//! | Saved RBX  |  [sp + 0]   <- Context stack pointer
//! +------------+
//! ```
//!
//! A freshly initialized stack additionally carries the entry function pointer
//! just below the stack top, where the init trampoline picks it up:
//!
//! ```text
//! +-------------+  <- Stack top
//! | Entry fn    |
//! +-------------+
//! | Trampoline  |  (the frame's resume RIP)
//! +-------------+
//! | RBP = 0     |
//! +-------------+
//! | RBX = 0     |  <- Initial context stack pointer
//! +-------------+
//! ```
//!
//! The register protocol at every resume point is the same: RDI holds the
//! stack pointer of the context that suspended itself, RSI holds its data
//! word. These are exactly the first two SysV argument registers, so the init
//! trampoline can enter `extern "C" fn(Transfer) -> !` with a plain jump.

use crate::{EntryFn, StackPointer};
use core::arch::{asm, naked_asm};

pub const STACK_ALIGNMENT: usize = 16;

#[inline]
pub unsafe fn init_stack(stack_top: StackPointer, entry: EntryFn) -> StackPointer {
    let mut sp = stack_top.get();
    debug_assert_eq!(sp % STACK_ALIGNMENT, 0);

    // Safety: the caller promised `stack_top` is the top of a writable region
    // large enough for at least this frame.
    unsafe {
        let mut push = |val: usize| {
            sp -= size_of::<usize>();
            (sp as *mut usize).write(val);
        };

        // Entry function, consumed by stack_init_trampoline.
        push(entry as usize);
        // Resume RIP of the initial frame.
        push(stack_init_trampoline as usize);
        // Initial RBP and RBX. Zero RBP terminates the frame pointer chain.
        push(0);
        push(0);
    }

    // Safety: sp is below a non-null stack top.
    unsafe { StackPointer::new_unchecked(sp) }
}

#[unsafe(naked)]
unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 16",
        // We arrive here via the `ret` in switch() the first time a fresh
        // context is resumed. At this point:
        // - RSP points at the entry function slot (the frame below it has
        //   already been popped).
        // - RDI holds the suspending context's stack pointer.
        // - RSI holds the data word.
        //
        // RDI/RSI are exactly the SysV registers for a two-word
        // `Transfer { context, data }` argument, so all that is left is to
        // fix up the stack and jump to the entry function.
        "pop rax",
        // Simulate the return address a `call` would have pushed so the entry
        // function observes a conforming stack alignment. The entry function
        // never returns, so zero is fine.
        "push 0",
        "jmp rax",
    }
}

/// Switches to the context suspended at `target`, returning the previously
/// running context's stack pointer and data word once something switches back.
#[inline]
pub unsafe fn switch(target: StackPointer, data: usize) -> (StackPointer, usize) {
    let (prev_sp, out_data): (usize, usize);

    // Safety: inline assembly
    unsafe {
        asm! {
            // Save our resume state on the current stack: resume address plus
            // the two LLVM-reserved callee-saved registers. The remaining
            // callee-saved registers are handled through the clobber list.
            "lea rax, [rip + 2f]",
            "push rax",
            "push rbp",
            "push rbx",

            // Publish our stack pointer and install the target's.
            "mov rax, rsp",
            "mov rsp, rdi",
            "mov rdi, rax",

            // Restore the target's RBX/RBP and jump to its resume address.
            "pop rbx",
            "pop rbp",
            "ret",

            // Resumed. The peer that switched to us left its stack pointer in
            // RDI and its data word in RSI, and has already popped our frame
            // and restored our RBX/RBP.
            "2:",

            inlateout("rdi") target.get() => prev_sp,
            inlateout("rsi") data => out_data,
            // Mark the remaining callee-saved registers as clobbered; RBX and
            // RBP are LLVM reserved registers and are spilled by hand above.
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }

    // Safety: the peer context's stack pointer is never null.
    (unsafe { StackPointer::new_unchecked(prev_sp) }, out_data)
}
