//! Architecture seam.
//!
//! The kernel proper is machine-independent; the two things it needs
//! from the CPU — saved register state and the context-switch primitive
//! — are defined here. On anything other than the real i586 target the
//! switch is a recording no-op so the scheduler logic can run under the
//! host test harness.

/// Callee-saved register file captured across a context switch
/// (i386 calling convention).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TaskContext {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
}

/// Signature of the context-switch primitive: save into `prev`, resume
/// from `next`. The scheduler treats this as opaque.
pub type SwitchFn = fn(prev: *mut TaskContext, next: *const TaskContext);

/// Stack-switching implementation for the i586 target.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn switch_to(prev: *mut TaskContext, next: *const TaskContext) {
    // SAFETY: prev and next point at live TaskContext values owned by
    // the scheduler; the asm saves the callee-saved file into prev and
    // reloads it from next, resuming at next.eip.
    unsafe {
        core::arch::asm!(
            "mov [{prev} + 0], edi",
            "mov [{prev} + 4], esi",
            "mov [{prev} + 8], ebx",
            "mov [{prev} + 12], ebp",
            "mov [{prev} + 16], esp",
            "lea eax, [2f]",
            "mov [{prev} + 20], eax",
            "mov edi, [{next} + 0]",
            "mov esi, [{next} + 4]",
            "mov ebx, [{next} + 8]",
            "mov ebp, [{next} + 12]",
            "mov esp, [{next} + 16]",
            "jmp [{next} + 20]",
            "2:",
            prev = in(reg) prev,
            next = in(reg) next,
            out("eax") _,
        );
    }
}

/// Host stand-in: remembers that a switch was requested and returns.
///
/// Under the test harness there is only one real thread of execution, so
/// "switching" just lets `schedule()` finish; callers re-check their
/// wait conditions in a loop, which is exactly what they do on hardware
/// after a genuine switch back.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn switch_to(prev: *mut TaskContext, next: *const TaskContext) {
    let _ = (prev, next);
}
