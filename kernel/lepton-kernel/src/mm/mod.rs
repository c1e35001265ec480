//! Kernel memory management: physical frames, the kernel heap, page
//! tables and per-task virtual memory areas.

pub mod frame;
pub mod heap;
pub mod paging;
pub mod vma;

pub use frame::FrameAllocator;
pub use heap::Heap;
pub use paging::{PageDirectory, PageFlags, PhysMapper};
pub use vma::{AddressSpace, VmArea};
