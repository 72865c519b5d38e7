//! The value/signal channel between a coroutine body and its driver.

/// Outcome reported by every [`Context::run`](crate::Context::run).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// An awaited operation failed. The error is available through
    /// [`Context::take_error`](crate::Context::take_error). The context can't
    /// be resumed until it is set up again.
    SysError,
    /// The body completed and returned this value.
    Done(Value),
    /// The body suspended and is waiting to be resumed.
    Pending,
    /// The body suspended because the device it works on is closed.
    IoClosed,
    /// The body suspended because the device it reads from hit end-of-file.
    IoEof,
}

impl Signal {
    /// Returns the numeric code of this signal.
    ///
    /// | Signal     | Code |
    /// |------------|------|
    /// | `SysError` | -1   |
    /// | `Done`     | 0    |
    /// | `Pending`  | 1    |
    /// | `IoClosed` | 2    |
    /// | `IoEof`    | 3    |
    pub fn code(&self) -> i32 {
        match self {
            Signal::SysError => -1,
            Signal::Done(_) => 0,
            Signal::Pending => 1,
            Signal::IoClosed => 2,
            Signal::IoEof => 3,
        }
    }

    /// Returns whether the body suspended and can be run again.
    ///
    /// `false` for [`Signal::Done`] and [`Signal::SysError`], so
    /// `while ctx.run().is_pending() {}` stops at either.
    pub fn is_pending(&self) -> bool {
        matches!(self, Signal::Pending | Signal::IoClosed | Signal::IoEof)
    }

    /// Returns the `Done` value as an `Option<Value>`.
    pub fn as_done(self) -> Option<Value> {
        match self {
            Signal::Done(val) => Some(val),
            _ => None,
        }
    }
}

impl From<Suspend> for Signal {
    fn from(kind: Suspend) -> Self {
        match kind {
            Suspend::Pending => Signal::Pending,
            Suspend::IoClosed => Signal::IoClosed,
            Suspend::IoEof => Signal::IoEof,
        }
    }
}

/// Reason a body gives when suspending itself with
/// [`Suspender::suspend_with`](crate::Suspender::suspend_with).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Suspend {
    /// Waiting for something, reported as [`Signal::Pending`].
    #[default]
    Pending,
    /// Reported as [`Signal::IoClosed`].
    IoClosed,
    /// Reported as [`Signal::IoEof`].
    IoEof,
}

/// Scalar or pointer payload returned by a completed body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    /// A signed integer.
    I64(i64),
    /// An unsigned integer.
    U64(u64),
    /// An address. Whatever it points to is owned by the body's protocol
    /// with its driver.
    Ptr(*mut ()),
}

impl Value {
    /// Returns the payload as a signed integer. Unsigned payloads are
    /// reinterpreted and pointers are converted to their address.
    pub fn as_i64(self) -> i64 {
        match self {
            Value::I64(v) => v,
            Value::U64(v) => v as i64,
            Value::Ptr(p) => p as usize as i64,
        }
    }

    /// Returns the payload as an unsigned integer.
    pub fn as_u64(self) -> u64 {
        match self {
            Value::I64(v) => v as u64,
            Value::U64(v) => v,
            Value::Ptr(p) => p as usize as u64,
        }
    }

    /// Returns the pointer payload, if this is one.
    pub fn as_ptr(self) -> Option<*mut ()> {
        match self {
            Value::Ptr(p) => Some(p),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::I64(0)
    }
}

/// A body that ends without a value returns 0.
impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::I64(0)
    }
}

macro_rules! value_from {
    ($variant:ident: $($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(val: $ty) -> Self {
                    Value::$variant(val.into())
                }
            }
        )*
    };
}

value_from!(I64: i8, i16, i32, i64);
value_from!(U64: u8, u16, u32, u64, bool);

impl From<usize> for Value {
    fn from(val: usize) -> Self {
        Value::U64(val as u64)
    }
}

impl From<isize> for Value {
    fn from(val: isize) -> Self {
        Value::I64(val as i64)
    }
}

impl<T> From<*mut T> for Value {
    fn from(ptr: *mut T) -> Self {
        Value::Ptr(ptr.cast())
    }
}

impl<T> From<*const T> for Value {
    fn from(ptr: *const T) -> Self {
        Value::Ptr(ptr as *mut ())
    }
}
