use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::task::Poll;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};

use crate::arch;
use crate::error::Result;
use crate::signal::{Signal, Suspend, Value};
use crate::stack::{DefaultStack, Stack, StackPointer, DEFAULT_STACK_SIZE};

const DEFAULT_NAME: &str = "coroutine";

// Words passed from the driver into the coroutine.
const CMD_BIND: usize = 0;
const CMD_SETUP: usize = 1;
const CMD_RESUME: usize = 2;
const CMD_RESET: usize = 3;

// Words passed from the coroutine back to the driver.
const EV_PARKED: usize = 0;
const EV_ARMED: usize = 1;
const EV_PENDING: usize = 2;
const EV_IO_CLOSED: usize = 3;
const EV_IO_EOF: usize = 4;
const EV_DONE: usize = 5;
const EV_SYS_ERROR: usize = 6;

/// Lifecycle state of a [`Context`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Bound and parked at its reset point. Needs a setup before it can run.
    Idle,
    /// Set up with an argument; the body has not started yet.
    Armed,
    /// The body is suspended and waits for the next run.
    Suspended,
    /// The body returned. Needs a setup before it can run again.
    Done,
    /// An awaited operation failed. Needs a setup before it can run again.
    Failed,
}

/// Panic payload used to unwind a failed body when its context is set up
/// again.
struct ForcedReset;

/// The part of the shared block that the body side sees.
struct Channel {
    name: Box<str>,
    value: Cell<Option<Value>>,
    error: Cell<Option<io::Error>>,
    resetting: Cell<bool>,
}

type Body<A> = Box<dyn FnMut(&Suspender, A) -> Value>;

/// Heap block shared between a context and the root frame on its stack.
struct Shared<A> {
    channel: Channel,
    arg: Cell<Option<A>>,
    body: UnsafeCell<Body<A>>,
}

/// A function running on its own stack that can be suspended and resumed
/// under the control of its driver.
///
/// The lifecycle is:
/// 1. [`bind`](Context::bind): maps a stack and parks the body's root frame
///    at its reset point. No body code runs.
/// 2. [`setup`](Context::setup): hands an argument to the parked frame.
/// 3. [`run`](Context::run), any number of times until it reports
///    [`Signal::Done`].
/// 4. Either `setup` again to reuse the stack for a new invocation, or
///    [`teardown`](Context::teardown).
///
/// Misusing the lifecycle (running before setup, running after completion,
/// setting up a pending body) panics in the driver with a message naming
/// the coroutine.
///
/// # `Send`
///
/// A context must be driven by the thread that bound it.
///
/// ```compile_fail
/// fn send<T: Send>() {}
/// send::<stackful_coro::Context<()>>();
/// ```
pub struct Context<A, S: Stack = DefaultStack> {
    // Stack that the body executes on. Body frames are unwound before it is
    // released, see `release`.
    stack: ManuallyDrop<S>,

    // Saved coroutine stack pointer. The root frame never returns, so there
    // always is one once bind has completed.
    stack_ptr: StackPointer,

    shared: NonNull<Shared<A>>,
    state: State,
    signal: Option<Signal>,

    // Invariant over A and !Send.
    marker: PhantomData<*mut A>,
}

impl<A: 'static> Context<A, DefaultStack> {
    /// Binds `body` to a new [`DefaultStack`] of [`DEFAULT_STACK_SIZE`]
    /// bytes.
    ///
    /// Use a [`Builder`] to choose the name and stack size.
    pub fn bind<F, R>(body: F) -> Result<Self>
    where
        F: FnMut(&Suspender, A) -> R + 'static,
        R: Into<Value>,
    {
        Builder::new().bind(body)
    }
}

impl<A: 'static, S: Stack + 'static> Context<A, S> {
    /// Binds `body` to the given stack.
    pub fn bind_with_stack<F, R>(stack: S, body: F) -> Self
    where
        F: FnMut(&Suspender, A) -> R + 'static,
        R: Into<Value>,
    {
        Self::bind_named(DEFAULT_NAME.into(), stack, body)
    }

    fn bind_named<F, R>(name: Box<str>, stack: S, mut body: F) -> Self
    where
        F: FnMut(&Suspender, A) -> R + 'static,
        R: Into<Value>,
    {
        let body: Body<A> = Box::new(move |suspender: &Suspender, arg: A| {
            body(suspender, arg).into()
        });
        let shared = Box::new(Shared {
            channel: Channel {
                name,
                value: Cell::new(None),
                error: Cell::new(None),
                resetting: Cell::new(false),
            },
            arg: Cell::new(None),
            body: UnsafeCell::new(body),
        });
        let shared = NonNull::from(Box::leak(shared));

        unsafe {
            // Write the shared block to the stack so the root frame receives
            // its address on the bootstrap switch.
            let stack_ptr = arch::init_stack(&stack, coroutine_root::<A>, shared);

            let mut ctx = Self {
                stack: ManuallyDrop::new(stack),
                stack_ptr,
                shared,
                state: State::Idle,
                signal: None,
                marker: PhantomData,
            };

            // Run the root frame up to its reset point.
            let event = ctx.switch(CMD_BIND);
            debug_assert_eq!(event, EV_PARKED);

            log::debug!(
                "bound coroutine '{}' to stack {:#x}..{:#x}",
                ctx.name(),
                ctx.stack.limit().get(),
                ctx.stack.base().get()
            );
            ctx
        }
    }
}

impl<A, S: Stack> Context<A, S> {
    /// Arms the context for a new invocation of the body with `arg`.
    ///
    /// The body itself does not start until the next [`run`](Self::run).
    /// The value and error slots of the channel are cleared.
    ///
    /// A [`Failed`](State::Failed) context is reset first: its body is
    /// unwound from the failed await, dropping its live locals. This
    /// requires `panic = "unwind"`.
    ///
    /// # Panics
    ///
    /// Panics if the body is suspended or armed.
    #[track_caller]
    pub fn setup(&mut self, arg: A) {
        let cmd = match self.state {
            State::Idle | State::Done => CMD_SETUP,
            State::Failed => CMD_RESET,
            State::Armed | State::Suspended => {
                self.usage_error("cannot setup a pending coroutine")
            }
        };

        let shared = self.shared();
        shared.channel.value.set(None);
        shared.channel.error.set(None);
        shared.arg.set(Some(arg));
        if cmd == CMD_RESET {
            log::debug!("resetting failed coroutine '{}'", self.name());
            shared.channel.resetting.set(true);
        }

        let event = self.switch(cmd);
        debug_assert_eq!(event, EV_ARMED);
        self.state = State::Armed;
        self.signal = None;
    }

    /// Resumes the body until it suspends or returns.
    ///
    /// # Panics
    ///
    /// Panics if the context has not been set up, has completed, or has
    /// reported [`Signal::SysError`].
    #[track_caller]
    pub fn run(&mut self) -> Signal {
        match self.state {
            State::Armed | State::Suspended => {}
            State::Idle => self.usage_error("task setup not done"),
            State::Done => self.usage_error("cannot resume after completion"),
            State::Failed => self.usage_error("called after system error"),
        }

        let (state, signal) = match self.switch(CMD_RESUME) {
            EV_PENDING => (State::Suspended, Signal::Pending),
            EV_IO_CLOSED => (State::Suspended, Signal::IoClosed),
            EV_IO_EOF => (State::Suspended, Signal::IoEof),
            EV_SYS_ERROR => (State::Failed, Signal::SysError),
            EV_DONE => {
                let val = self.shared().channel.value.get().unwrap_or_default();
                (State::Done, Signal::Done(val))
            }
            event => unreachable!("unexpected event {} from coroutine", event),
        };
        log::trace!("coroutine '{}' reported {:?}", self.name(), signal);

        self.state = state;
        self.signal = Some(signal);
        signal
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns whether the current invocation has been set up but has not
    /// completed yet.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, State::Armed | State::Suspended | State::Failed)
    }

    /// Signal reported by the last run, if any since the last setup.
    pub fn signal(&self) -> Option<Signal> {
        self.signal
    }

    /// Value returned by the body, if it completed since the last setup.
    pub fn value(&self) -> Option<Value> {
        self.shared().channel.value.get()
    }

    /// Takes the error behind the last [`Signal::SysError`].
    pub fn take_error(&self) -> Option<io::Error> {
        self.shared().channel.error.take()
    }

    /// Name given to the context at bind time.
    pub fn name(&self) -> &str {
        &self.shared().channel.name
    }

    /// Returns a reference to the stack the body runs on.
    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// Consumes the context and releases its stack.
    ///
    /// If the body is suspended ([`Suspended`](State::Suspended) or
    /// [`Failed`](State::Failed)) it is first unwound from its suspension
    /// point, dropping its live locals, the same way a setup after a failure
    /// does. With `panic = "abort"` a suspended body can't be unwound, so its
    /// stack is leaked instead. Dropping a context does the same as
    /// `teardown` but ignores errors.
    ///
    /// The context can't be used afterwards:
    ///
    /// ```compile_fail
    /// let mut ctx = stackful_coro::Context::<()>::bind(|_, ()| ()).unwrap();
    /// ctx.teardown().unwrap();
    /// ctx.setup(());
    /// ```
    pub fn teardown(self) -> io::Result<()> {
        let mut this = ManuallyDrop::new(self);
        unsafe { this.release(false) }
    }

    /// Consumes the context and releases its stack without unwinding a
    /// suspended body. No destructors run for objects on the stack.
    ///
    /// # Safety
    ///
    /// Nothing may reference the body's stack frames anymore, for example
    /// threads spawned from a scope inside the body.
    pub unsafe fn force_teardown(self) -> io::Result<()> {
        let mut this = ManuallyDrop::new(self);
        this.release(true)
    }

    /// Consumes the context and returns its stack so it can be bound to a new
    /// body.
    ///
    /// # Panics
    ///
    /// Panics if the body is suspended.
    #[track_caller]
    pub fn into_stack(self) -> S {
        if self.frames_live() {
            self.usage_error("cannot extract the stack of a suspended coroutine");
        }

        let mut this = ManuallyDrop::new(self);
        unsafe {
            drop(Box::from_raw(this.shared.as_ptr()));
            ManuallyDrop::take(&mut this.stack)
        }
    }

    fn shared(&self) -> &Shared<A> {
        unsafe { self.shared.as_ref() }
    }

    /// Whether body frames other than the parked root frame are on the stack.
    fn frames_live(&self) -> bool {
        matches!(self.state, State::Suspended | State::Failed)
    }

    #[cold]
    #[track_caller]
    fn usage_error(&self, msg: &str) -> ! {
        panic!("coroutine '{}': {}", self.name(), msg)
    }

    /// Passes `cmd` to the coroutine and returns the event it switches back
    /// with.
    fn switch(&mut self, cmd: usize) -> usize {
        log::trace!("switching into coroutine '{}' with {}", self.name(), cmd);

        let (event, stack_ptr) =
            unsafe { arch::switch_and_link(cmd, self.stack_ptr, self.stack.base()) };
        debug_assert!(stack_ptr.is_some(), "coroutine root frame returned");
        if let Some(stack_ptr) = stack_ptr {
            self.stack_ptr = stack_ptr;
        }

        if !self.stack.check() {
            abort_coroutine(self.name(), "stack overflow detected");
        }
        event
    }

    /// Unwinds a suspended body back to the reset point of its root frame.
    fn unwind_body(&mut self) {
        log::debug!(
            "unwinding coroutine '{}' torn down in state {:?}",
            self.name(),
            self.state
        );
        self.shared().channel.resetting.set(true);
        let event = self.switch(CMD_RESET);
        debug_assert_eq!(event, EV_ARMED);
        self.state = State::Armed;
    }

    unsafe fn release(&mut self, force: bool) -> io::Result<()> {
        if !force && self.frames_live() {
            if cfg!(panic = "unwind") {
                self.unwind_body();
            } else {
                log::warn!(
                    "leaking stack of coroutine '{}' torn down in state {:?}",
                    self.name(),
                    self.state
                );
                return Ok(());
            }
        }

        log::debug!("tearing down coroutine '{}'", self.name());
        let _shared = scopeguard::guard(self.shared, |shared| {
            drop(Box::from_raw(shared.as_ptr()));
        });
        ManuallyDrop::take(&mut self.stack).release()
    }
}

impl<A, S: Stack> Drop for Context<A, S> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.release(false) } {
            log::error!("failed to release coroutine stack: {}", e);
        }
    }
}

impl<A, S: Stack> fmt::Debug for Context<A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("signal", &self.signal)
            .finish()
    }
}

/// Root frame of every coroutine stack. Entered once through the trampoline
/// at bind time and never returns.
unsafe extern "C" fn coroutine_root<A>(
    arg: usize,
    parent_link: *mut StackPointer,
    obj: *mut NonNull<Shared<A>>,
) -> ! {
    debug_assert_eq!(arg, CMD_BIND);
    let shared = obj.read();
    let shared = shared.as_ref();
    let channel = &shared.channel;
    let suspender = Suspender {
        parent_link,
        channel,
        marker: PhantomData,
    };

    // Reset point: parked here until the first setup.
    let mut cmd = arch::switch_yield(EV_PARKED, parent_link);
    loop {
        debug_assert!(cmd == CMD_SETUP || cmd == CMD_RESET);
        channel.resetting.set(false);

        cmd = arch::switch_yield(EV_ARMED, parent_link);
        debug_assert_eq!(cmd, CMD_RESUME);

        let arg = match shared.arg.take() {
            Some(arg) => arg,
            None => abort_coroutine(&channel.name, "resumed without an argument"),
        };
        let body = &mut *shared.body.get();
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&suspender, arg)));

        if channel.resetting.get() {
            // Unwound by a setup after a failure: re-arm straight away.
            cmd = CMD_RESET;
            continue;
        }

        match result {
            Ok(val) => {
                channel.value.set(Some(val));
                cmd = arch::switch_yield(EV_DONE, parent_link);
            }
            Err(payload) => {
                let msg = format!("body panicked: {}", panic_message(&*payload));
                abort_coroutine(&channel.name, &msg);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "Box<dyn Any>"
    }
}

#[cold]
fn abort_coroutine(name: &str, msg: &str) -> ! {
    log::error!("coroutine '{}': {}, aborting", name, msg);
    eprintln!("ERROR in coroutine {}: {}", name, msg);
    std::process::abort()
}

/// Handle given to a body to suspend itself.
///
/// Only usable on the coroutine stack it was handed out on, and never from
/// another thread.
pub struct Suspender {
    parent_link: *mut StackPointer,
    channel: *const Channel,
    marker: PhantomData<*mut ()>,
}

impl Suspender {
    /// Suspends the body reporting [`Signal::Pending`].
    pub fn suspend(&self) {
        self.suspend_with(Suspend::Pending);
    }

    /// Suspends the body reporting the given condition to the driver.
    ///
    /// Returns when the driver runs the context again.
    pub fn suspend_with(&self, kind: Suspend) {
        let event = match kind {
            Suspend::Pending => EV_PENDING,
            Suspend::IoClosed => EV_IO_CLOSED,
            Suspend::IoEof => EV_IO_EOF,
        };
        self.switch(event);
    }

    /// Polls `op` until it is ready, suspending with [`Signal::Pending`]
    /// every time it is not.
    pub fn await_poll<T>(&self, mut op: impl FnMut() -> Poll<T>) -> T {
        loop {
            match op() {
                Poll::Ready(val) => return val,
                Poll::Pending => self.suspend(),
            }
        }
    }

    /// Retries `op` until it completes.
    ///
    /// - `WouldBlock` suspends with [`Signal::Pending`] and retries once the
    ///   driver resumes the body.
    /// - `Interrupted` retries immediately.
    /// - Any other error is handed to the driver through
    ///   [`fail`](Self::fail).
    pub fn await_io<T>(&self, mut op: impl FnMut() -> io::Result<T>) -> T {
        loop {
            match op() {
                Ok(val) => return val,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.suspend(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => self.fail(e),
            }
        }
    }

    /// Reports `err` to the driver with [`Signal::SysError`].
    ///
    /// Never returns: the driver can only set the context up again, which
    /// unwinds the body from here.
    pub fn fail(&self, err: io::Error) -> ! {
        log::trace!("coroutine '{}' failed: {}", self.name(), err);
        self.channel().error.set(Some(err));
        loop {
            self.switch(EV_SYS_ERROR);
        }
    }

    /// Name of the running coroutine.
    pub fn name(&self) -> &str {
        &self.channel().name
    }

    fn channel(&self) -> &Channel {
        unsafe { &*self.channel }
    }

    fn switch(&self, event: usize) {
        if self.channel().resetting.get() {
            abort_coroutine(self.name(), "reset unwind was caught and not rethrown");
        }

        let cmd = unsafe { arch::switch_yield(event, self.parent_link) };
        if cmd == CMD_RESET {
            panic::resume_unwind(Box::new(ForcedReset));
        }
        debug_assert_eq!(cmd, CMD_RESUME);
    }
}

/// Configuration for binding a [`Context`].
///
/// ```
/// use stackful_coro::Builder;
///
/// let mut ctx = Builder::new()
///     .name("worker")
///     .stack_size(256 * 1024)
///     .bind(|_, x: u32| x * 2)
///     .unwrap();
/// ctx.setup(21);
/// assert_eq!(ctx.run().as_done().map(|v| v.as_u64()), Some(42));
/// ```
#[derive(Clone, Debug)]
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a builder with the default name and stack size.
    pub fn new() -> Self {
        Self {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Names the context. The name appears in usage panics and log records.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the usable size of the stack created by [`bind`](Self::bind).
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Binds `body` to a new [`DefaultStack`].
    pub fn bind<A, F, R>(self, body: F) -> Result<Context<A>>
    where
        A: 'static,
        F: FnMut(&Suspender, A) -> R + 'static,
        R: Into<Value>,
    {
        let stack = DefaultStack::new(self.stack_size)?;
        Ok(self.bind_with_stack(stack, body))
    }

    /// Binds `body` to the given stack. The configured stack size is ignored.
    pub fn bind_with_stack<A, S, F, R>(self, stack: S, body: F) -> Context<A, S>
    where
        A: 'static,
        S: Stack + 'static,
        F: FnMut(&Suspender, A) -> R + 'static,
        R: Into<Value>,
    {
        let name = self.name.unwrap_or_else(|| DEFAULT_NAME.into());
        Context::bind_named(name.into_boxed_str(), stack, body)
    }
}
