//! Asymmetric stackful coroutines for x86-64.
//!
//! ## Overview
//!
//! This crate provides a minimal primitive for context switching between
//! stacks, in the form of [coroutines]. A coroutine is a closure that runs
//! on its own private stack and can suspend itself at any point in its call
//! stack; resuming it continues exactly where it left off, with every local
//! intact. Control only ever moves between a coroutine and its most recent
//! resumer, one coroutine at a time per thread: this is cooperative
//! multitasking with the caller as the scheduler.
//!
//! The engine underneath is a register-record context switch: the
//! callee-saved state mandated by the platform ABI (including MXCSR, the
//! x87 control word, and on Windows the callee-saved XMM registers and the
//! TIB stack bounds) is saved into one record, loaded from another and
//! jumped into. Stacks are allocated page-aligned from the OS and flanked
//! with inaccessible guard pages, or borrowed from a caller-supplied
//! buffer.
//!
//! [coroutines]: https://en.wikipedia.org/wiki/Coroutine
//!
//! ## Example
//!
//! ```rust
//! use coswitch::{Coroutine, CoroutineResult};
//!
//! fn main() {
//!     let mut coroutine = Coroutine::new(|yielder, input| {
//!         println!("[coroutine] started with input {}", input);
//!         for i in 0..5 {
//!             let input = yielder.suspend(i);
//!             println!("[coroutine] resumed with {}", input);
//!         }
//!         "done"
//!     });
//!
//!     let mut counter = 100;
//!     loop {
//!         match coroutine.resume(counter) {
//!             CoroutineResult::Yield(i) => println!("[main] got {} back", i),
//!             CoroutineResult::Return(msg) => {
//!                 println!("[main] coroutine finished: {}", msg);
//!                 break;
//!             }
//!         }
//!         counter += 1;
//!     }
//! }
//! ```
//!
//! ## Supported targets
//!
//! x86-64 only, on ELF platforms (Linux, BSD), Darwin and Windows. Any
//! other architecture fails to compile.
//!
//! ## Cargo features
//!
//! #### `guard-pages` (enabled by default)
//!
//! Flanks every owned stack with an inaccessible page at each end so that
//! an overflow faults instead of corrupting adjacent memory. Borrowed
//! stacks are never guarded.
//!
//! #### `stack-usage`
//!
//! Fills fresh stacks with a sentinel byte and exposes
//! [`ScopedCoroutine::stack_usage`], a high-water-mark diagnostic for
//! sizing stacks.
//!
//! ## What this crate does not do
//!
//! There is no scheduler, no preemption and no cross-thread resumption: a
//! coroutine is pinned to the thread that created it. Panics do not
//! propagate across the switch boundary; a panicking body aborts the
//! process. Dropping a suspended coroutine abandons its body without
//! unwinding it, so bodies should keep transient state in the scratch
//! arena (see [`env::Environment`]) or release resources before their last
//! suspension point.

#![warn(missing_docs)]

mod arch;
mod coroutine;
pub mod env;
pub mod stack;
#[cfg(feature = "stack-usage")]
mod usage;
mod util;

pub use coroutine::*;
#[cfg(feature = "stack-usage")]
pub use usage::StackUsage;

#[cfg(test)]
mod tests;
