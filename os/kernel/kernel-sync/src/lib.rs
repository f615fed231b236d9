//! # Kernel synchronization primitives
//!
//! Spin-based locks for code that cannot sleep: the page-table core takes
//! these while it edits hardware-visible tables.
//!
//! | Type | Use |
//! |------|-----|
//! | [`SpinMutex`] | short critical sections, test-and-test-and-set |
//! | [`TicketMutex`] | FIFO-fair mutual exclusion under contention |
//! | [`RwLock`] | many concurrent readers or one writer, from `spin` |
//!
//! Every lock hands out an RAII guard; dropping the guard releases the lock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw;

pub use mutex::{Mutex, MutexGuard};
pub use raw::{RawLock, RawSpin, RawTicket};
pub use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Spin mutex for short critical sections.
pub type SpinMutex<T> = Mutex<T, RawSpin>;

/// Fair mutex for locks that see contention.
pub type TicketMutex<T> = Mutex<T, RawTicket>;
