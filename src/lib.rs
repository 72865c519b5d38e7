//! Stackful coroutines with explicit bind/setup/run/teardown control.
//!
//! *WARNING: Abusing coroutines may result in tasty spaghetti code.*
//!
//! ## Overview
//!
//! A [`Context`] gives a function its own call stack so that it can be written
//! in ordinary blocking style and still be suspended from any depth of its
//! call graph. Its driver decides when it runs: every [`Context::run`] resumes
//! the body until it suspends again or returns, and reports what happened as
//! a [`Signal`].
//!
//! A context is bound once and can be set up any number of times. Binding maps
//! the stack and parks the body's root frame at a reset point; each setup hands
//! a fresh argument to that frame, so reusing a context skips the cost of
//! mapping a new stack.
//!
//! ## Example
//!
//! ```rust
//! use stackful_coro::{Context, Signal, Value};
//!
//! fn main() {
//!     let mut ctx = Context::bind(|s, start: u32| {
//!         let mut n = start;
//!         while n > 0 {
//!             n -= 1;
//!             println!("[coroutine] {} left", n);
//!             s.suspend();
//!         }
//!     })
//!     .unwrap();
//!
//!     ctx.setup(3);
//!     loop {
//!         match ctx.run() {
//!             Signal::Pending => println!("[main] coroutine is pending"),
//!             Signal::Done(val) => {
//!                 assert_eq!(val, Value::I64(0));
//!                 break;
//!             }
//!             other => panic!("unexpected {:?}", other),
//!         }
//!     }
//!
//!     ctx.teardown().unwrap();
//! }
//! ```
//!
//! #### Output
//!
//! ```text
//! [coroutine] 2 left
//! [main] coroutine is pending
//! [coroutine] 1 left
//! [main] coroutine is pending
//! [coroutine] 0 left
//! [main] coroutine is pending
//! ```
//!
//! ## Awaiting
//!
//! A body waits on an operation with [`Suspender::await_io`] or
//! [`Suspender::await_poll`]. The operation is retried every time the driver
//! resumes the body, until it completes. Fatal errors are reported to the
//! driver as [`Signal::SysError`] and the error can be picked up with
//! [`Context::take_error`]. The [`io`] module provides non-blocking reads and
//! writes on raw file descriptors in that shape.
//!
//! ## Stacks
//!
//! [`DefaultStack`](stack::DefaultStack) maps its memory from the OS and
//! protects the lowest page, so a stack overflow faults immediately instead of
//! corrupting memory. Without the `default-stack` feature a
//! [`HeapStack`](stack::HeapStack) is used, which detects overflows with a
//! canary after the fact and aborts.
//!
//! ## Panics and failure modes
//!
//! - Driving a context out of order (running it before setup or after it
//!   completed, setting it up while it is pending) panics in the driver.
//! - A panic inside a body can't cross into the driver: it aborts the process
//!   after logging which coroutine panicked.
//! - Tearing down or dropping a suspended context unwinds its body first, so
//!   the locals on its stack are dropped before the stack is unmapped. This
//!   needs `panic = "unwind"`; otherwise the stack is leaked.
//!   [`Context::force_teardown`] unmaps without unwinding.
//!
//! ## Logging
//!
//! Lifecycle events are reported through the [`log`](https://docs.rs/log)
//! facade: binds and teardowns at `debug`, every switch at `trace`. The crate
//! never installs a logger.
//!
//! ## Supported targets
//!
//! |         | ELF (Linux, BSD) | Darwin (macOS) |
//! |---------|------------------|----------------|
//! | x86_64  | ✅                | ✅              |
//! | AArch64 | ✅                | ✅              |
//!
//! ## Cargo features
//!
//! #### `default-stack` (Enabled by default)
//!
//! Makes [`DefaultStack`](stack::DefaultStack) the guard-page stack. When
//! disabled, `DefaultStack` is an alias of [`HeapStack`](stack::HeapStack).

#![warn(missing_docs)]

mod arch;
mod context;
pub mod error;
pub mod io;
mod signal;
pub mod stack;

pub use context::*;
pub use error::{Error, Result};
pub use signal::*;

#[cfg(test)]
mod tests;
