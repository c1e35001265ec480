//! Compile-time kernel configuration.
//!
//! Single source of truth for the tunables the rest of the kernel
//! reads. Values mirror the platform the kernel targets: a single-CPU
//! 32-bit x86 machine with the kernel mapped in the top quarter of the
//! address space.

/// Timer interrupt frequency in ticks per second.
pub const HZ: u64 = 100;

/// Size of a page / physical frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Virtual address where the shared kernel half begins. Everything at or
/// above this address is mapped identically into every address space.
pub const KERNEL_PAGE_OFFSET: usize = 0xC000_0000;

/// Kernel heap placement and growth bounds.
pub const KHEAP_START: usize = 0xD000_0000;
/// Initial mapped size of the kernel heap.
pub const KHEAP_INITIAL_SIZE: usize = 0x10_0000;
/// Hard ceiling for kernel heap growth.
pub const KHEAP_MAX_SIZE: usize = 0x400_0000;

/// Per-task limit on open file descriptors.
pub const NR_OPEN: usize = 256;

/// System-wide limit on tasks.
pub const NR_TASKS: usize = 1024;

/// Size of a task's kernel stack in bytes.
pub const KSTACK_SIZE: usize = 8192;

/// Maximum symlink expansions during one path walk.
pub const MAX_SYMLINK_DEPTH: usize = 8;

/// Default scheduling priority (initial tick budget).
pub const DEF_PRIORITY: i32 = 20;

/// Capacity of the buffer cache in blocks.
pub const NR_BUFFERS: usize = 256;

/// Base of the user mmap arena.
pub const USER_MMAP_BASE: usize = 0x4000_0000;

/// Lowest address user code may map.
pub const USER_MIN_ADDR: usize = 0x1000;

/// Nodename reported by `uname` until a hostname is set.
pub const DEFAULT_NODENAME: &str = "lepton";

/// Release string reported by `uname`.
pub const RELEASE: &str = "0.1.0";
