// SPDX-License-Identifier: PMPL-1.0-or-later

//! Lock-minimal coordination primitives.

pub mod atomics;
pub mod lockfree;

pub use atomics::{AtomicCounter, AtomicDuration, AtomicF64, AtomicFlag, AtomicGauge};
pub use lockfree::{LockFreeQueue, LockFreeStack};
