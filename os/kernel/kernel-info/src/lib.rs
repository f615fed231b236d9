//! # Kernel Memory Layout and Tunables
//!
//! Compile-time layout constants shared by the radix MMU core and the code
//! that boots it. Everything here is a `const`, validated at compile time.
//!
//! ## Virtual Address Space Layout
//!
//! The two most significant address bits select the quadrant. Quadrant 0
//! holds user address spaces; quadrant 3 holds the kernel and is always
//! translated with PID 0.
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//!                       │   (one radix tree per process)  │
//! VM_MAXUSER_ADDRESS    ├─────────────────────────────────┤ 0x000f_ffff_ffff_ffff
//!                       │        not translated           │
//! DMAP_BASE_ADDRESS     ├─────────────────────────────────┤ 0xc000_0000_0000_0000
//!                       │     Direct Map of Physical      │
//!                       │   Memory (1 GiB leaf entries)   │
//! DMAP_MAX_ADDRESS      ├─────────────────────────────────┤ 0xc007_ffff_ffff_ffff
//! VM_MIN_KERNEL_ADDRESS ├─────────────────────────────────┤ 0xc008_0000_0000_0000
//!                       │        Kernel VA (KVA)          │
//! VM_MAX_KERNEL_ADDRESS └─────────────────────────────────┘ 0xc00f_ffff_ffff_ffff
//! ```
//!
//! The direct map and KVA live in different root entries of the kernel
//! tree: the direct map starts at root index 0, KVA at root index `0x1000`.
//!
//! ## Tunables
//!
//! The `DEFAULT_*` constants seed the runtime configuration of the MMU core;
//! a boot path may override them before bootstrap.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
