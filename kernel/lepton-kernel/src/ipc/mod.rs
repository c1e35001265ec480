//! Inter-process communication: pipes and System V shared memory.
//!
//! Kernel-internal semaphores live with the scheduler
//! ([`crate::sched::Semaphore`]); this module holds the user-visible
//! conduits.

pub mod pipe;
pub mod shm;
