// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::utils::{EncodedValue, allocate_obj_on_stack, push};
use crate::{FiberStack, StackPointer};
use core::arch::{asm, naked_asm};

pub const STACK_ALIGNMENT: usize = 16;

#[inline]
pub unsafe fn init_stack<T>(
    stack: &dyn FiberStack,
    func: unsafe extern "C-unwind" fn(arg: EncodedValue, sp: &mut StackPointer, obj: *mut T) -> !,
    obj: T,
) -> (StackPointer, StackPointer) {
    // Safety: ensured by caller
    unsafe {
        let mut sp = stack.top().get();

        // Place the address of the initial function to execute at the top of the
        // stack. This is read by stack_init_trampoline() and jumped to.
        push(&mut sp, Some(func as usize));

        // Placeholder for the stack pointer value of the parent context. This is
        // filled in every time switch_and_link() is called.
        push(&mut sp, None);

        // Allocate space on the stack for the initial object, rounding to
        // STACK_ALIGNMENT.
        allocate_obj_on_stack(&mut sp, 16, obj);
        let init_obj = sp;

        // Set up an address at the top of the stack which is called by
        // switch_and_link() during the initial context switch.
        push(&mut sp, Some(stack_init_trampoline as usize));

        (
            StackPointer::new_unchecked(sp),
            StackPointer::new_unchecked(init_obj),
        )
    }
}

#[unsafe(naked)]
pub unsafe extern "C" fn stack_init_trampoline() {
    // Safety: inline assembly
    naked_asm! {
        ".balign 16",
        ".cfi_startproc",
        // At this point our register state contains the following:
        // - RSP points to the top of the parent stack.
        // - RBP holds its value from the parent context.
        // - RDX points to the top of our stack.
        // - RSI points to the base of our stack.
        // - RDI contains the argument passed from switch_and_link.
        "push rbp",
        // Fill in the parent link near the base of the stack.
        "mov [rsi - 16], rsp",
        "sub rsi, 16",
        // Switch to the fiber stack, skipping the address of
        // stack_init_trampoline() at the top of the stack.
        "lea rsp, [rdx + 8]",
        "mov rbp, rsi",
        ".cfi_escape 0x0f,  /* DW_CFA_def_cfa_expression */\
        5,                  /* the byte length of this expression */\
        0x76, 0x00,         /* DW_OP_breg6 (rbp + 0) */\
        0x06,               /* DW_OP_deref */\
        0x23, 0x18          /*DW_OP_plus_uconst 24*/",
        ".cfi_offset rbx, -8",
        ".cfi_offset rip, -16",
        ".cfi_offset rbp, -24",
        "mov rdx, rsp",
        // Manually set up a return address and JMP instead of CALL, to avoid a
        // misalignment of the CPU's return address predictor when a RET is
        // later executed in switch_yield()/switch_and_reset().
        "lea rcx, [rip + 2f]",
        "push rcx",
        "jmp [rsi + 8]",
        "2:",
        ".cfi_endproc",
    }
}

/// Transfers control to a fiber along with an argument, linking the two stacks
/// together so unwinding can cross the switch.
#[inline]
pub unsafe fn switch_and_link(
    arg0: EncodedValue,
    sp: StackPointer,
    top_of_stack: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    // Safety: inline assembly
    unsafe {
        asm! {
            // RBX and RBP are LLVM reserved registers, save/restore manually.
            "push rbx",
            ".cfi_escape 0x2e, 0x00",
            "call [rdx]",
            "pop rbx",
            inlateout("rdi") arg0 => ret_val,
            lateout("rsi") ret_sp,
            in("rsi") top_of_stack.get() as u64,
            in("rdx") sp.get() as u64,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
            options(may_unwind)
        }
    }

    (ret_val, StackPointer::new(ret_sp))
}

#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    // Safety: inline assembly
    unsafe {
        asm! {
            "push rbp",
            "push rbx",
            "lea rax, [rip + 2f]",
            "push rax",
            "mov rsi, rsp",
            "mov rsp, [rdx]",
            "pop rbp",
            ".cfi_escape 0x2e, 0x00",
            "ret",
            "2:",
            "push rbp",
            "mov [rsi - 16], rsp",
            "lea rsp, [rdx + 8]",
            "pop rbx",
            "pop rbp",
            inlateout("rdi") arg => ret_val,
            in("rdx") parent_link as u64,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
            options(may_unwind)
        }
    }

    ret_val
}

#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    // Safety: inline assembly
    unsafe {
        asm! {
            "mov rsp, [{parent_link}]",
            "pop rbp",
            "ret",
            parent_link = in(reg) parent_link as u64,
            in("rdi") arg,
            // Hard-code the returned stack pointer value to 0 to indicate that
            // this fiber is done.
            in("rsi") 0,
            options(noreturn),
        }
    }
}
