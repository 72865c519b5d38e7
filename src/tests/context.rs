use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::task::Poll;
use std::thread;

use crate::stack::{HeapStack, Stack, MIN_STACK_SIZE};
use crate::{Builder, Context, Signal, State, Suspend, Value};

struct SetOnDrop(Rc<Cell<bool>>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[test]
fn smoke() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let mut ctx = Context::<()>::bind(move |_, ()| {
        hit2.set(true);
    })
    .unwrap();
    assert_eq!(ctx.state(), State::Idle);
    assert!(!ctx.is_pending());
    assert_eq!(ctx.name(), "coroutine");

    ctx.setup(());
    assert!(!hit.get());
    assert_eq!(ctx.state(), State::Armed);
    assert!(ctx.is_pending());

    assert_eq!(ctx.run(), Signal::Done(Value::I64(0)));
    assert!(hit.get());
    assert_eq!(ctx.state(), State::Done);
    assert!(!ctx.is_pending());
    assert_eq!(ctx.value(), Some(Value::I64(0)));
    ctx.teardown().unwrap();
}

#[test]
fn setup_runs_no_body_code() {
    let steps = Rc::new(Cell::new(0));
    let steps2 = steps.clone();
    let mut ctx = Context::bind(move |s, inc: u32| {
        steps2.set(steps2.get() + inc);
        s.suspend();
        steps2.set(steps2.get() + inc);
    })
    .unwrap();

    ctx.setup(10);
    assert_eq!(steps.get(), 0);
    assert_eq!(ctx.run(), Signal::Pending);
    assert_eq!(steps.get(), 10);
    assert_eq!(ctx.state(), State::Suspended);
    assert!(ctx.run().as_done().is_some());
    assert_eq!(steps.get(), 20);
}

#[test]
fn countdown() {
    const N: i32 = 5;

    let mut ctx = Context::bind(|s, counter: Rc<Cell<i32>>| {
        while counter.get() > 0 {
            counter.set(counter.get() - 1);
            s.suspend();
        }
    })
    .unwrap();

    let counter = Rc::new(Cell::new(N));
    ctx.setup(counter.clone());
    for k in 1..=N {
        assert_eq!(ctx.run(), Signal::Pending);
        assert_eq!(counter.get(), N - k);
    }
    assert_eq!(ctx.run(), Signal::Done(Value::I64(0)));
    assert_eq!(counter.get(), 0);
}

#[test]
fn locals_persist_across_suspends() {
    let mut ctx = Context::bind(|s, n: usize| {
        let mut seen = Vec::new();
        for i in 0..n {
            seen.push(i * i);
            s.suspend();
        }
        seen.iter().sum::<usize>()
    })
    .unwrap();

    ctx.setup(4);
    for _ in 0..4 {
        assert_eq!(ctx.run(), Signal::Pending);
    }
    assert_eq!(ctx.run(), Signal::Done(Value::U64(14)));
}

#[test]
fn await_poll_counts_pending() {
    const K: usize = 3;

    let advanced = Rc::new(Cell::new(false));
    let advanced2 = advanced.clone();
    let mut ctx = Context::bind(move |s, ()| {
        let mut polls = 0;
        let val = s.await_poll(|| {
            polls += 1;
            if polls > K {
                Poll::Ready(polls)
            } else {
                Poll::Pending
            }
        });
        advanced2.set(true);
        val
    })
    .unwrap();

    ctx.setup(());
    for _ in 0..K {
        assert_eq!(ctx.run(), Signal::Pending);
        assert!(!advanced.get());
    }
    assert_eq!(ctx.run(), Signal::Done(Value::U64(K as u64 + 1)));
    assert!(advanced.get());
}

#[test]
fn await_io_retries() {
    let mut ctx = Context::bind(|s, ()| {
        let results: Vec<io::Result<i32>> = vec![
            Err(io::ErrorKind::WouldBlock.into()),
            Err(io::ErrorKind::Interrupted.into()),
            Err(io::ErrorKind::WouldBlock.into()),
            Ok(7),
        ];
        let mut results = results.into_iter();
        s.await_io(|| results.next().unwrap())
    })
    .unwrap();

    ctx.setup(());
    // Interrupted is retried without suspending.
    assert_eq!(ctx.run(), Signal::Pending);
    assert_eq!(ctx.run(), Signal::Pending);
    assert_eq!(ctx.run(), Signal::Done(Value::I64(7)));
}

#[test]
fn sys_error() {
    let mut ctx = Builder::new()
        .name("failing")
        .bind(|s, ()| {
            s.await_io(|| -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "boom"))
            });
        })
        .unwrap();

    ctx.setup(());
    assert_eq!(ctx.run(), Signal::SysError);
    assert_eq!(ctx.signal(), Some(Signal::SysError));
    assert_eq!(ctx.state(), State::Failed);
    assert!(ctx.is_pending());
    assert_eq!(ctx.value(), None);

    let err = ctx.take_error().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::Other);
    assert_eq!(err.to_string(), "boom");
    assert!(ctx.take_error().is_none());
}

#[test]
#[should_panic(expected = "coroutine 'failing': called after system error")]
fn run_after_sys_error() {
    let mut ctx = Builder::new()
        .name("failing")
        .bind(|s, ()| -> () {
            s.fail(io::Error::from_raw_os_error(libc::EIO));
        })
        .unwrap();
    ctx.setup(());
    assert_eq!(ctx.run(), Signal::SysError);
    ctx.run();
}

#[test]
fn setup_after_sys_error_unwinds_body() {
    let dropped = Rc::new(Cell::new(false));
    let mut ctx = Context::bind(|s, (dropped, fail): (Rc<Cell<bool>>, bool)| {
        let _guard = SetOnDrop(dropped);
        if fail {
            s.fail(io::ErrorKind::BrokenPipe.into());
        }
        1
    })
    .unwrap();

    ctx.setup((dropped.clone(), true));
    assert_eq!(ctx.run(), Signal::SysError);
    assert!(!dropped.get());

    let dropped2 = Rc::new(Cell::new(false));
    ctx.setup((dropped2.clone(), false));
    assert!(dropped.get());
    assert_eq!(ctx.state(), State::Armed);
    assert!(ctx.take_error().is_none());

    assert_eq!(ctx.run(), Signal::Done(Value::I64(1)));
    assert!(dropped2.get());
}

#[test]
#[should_panic(expected = "coroutine 'worker': task setup not done")]
fn run_before_setup() {
    let mut ctx = Builder::new().name("worker").bind(|_, ()| ()).unwrap();
    ctx.run();
}

#[test]
#[should_panic(expected = "coroutine 'worker': cannot resume after completion")]
fn run_after_done() {
    let mut ctx = Builder::new().name("worker").bind(|_, ()| ()).unwrap();
    ctx.setup(());
    assert!(ctx.run().as_done().is_some());
    ctx.run();
}

#[test]
#[should_panic(expected = "coroutine 'worker': cannot setup a pending coroutine")]
fn setup_while_suspended() {
    let mut ctx = Builder::new()
        .name("worker")
        .bind(|s, ()| s.suspend())
        .unwrap();
    ctx.setup(());
    assert_eq!(ctx.run(), Signal::Pending);
    ctx.setup(());
}

#[test]
#[should_panic(expected = "cannot setup a pending coroutine")]
fn setup_twice() {
    let mut ctx = Context::bind(|_, ()| ()).unwrap();
    ctx.setup(());
    ctx.setup(());
}

#[test]
fn reuse_after_done() {
    let mut ctx = Context::bind(|s, n: i64| {
        s.suspend();
        n * 2
    })
    .unwrap();

    for n in 1..4 {
        ctx.setup(n);
        assert_eq!(ctx.value(), None);
        assert_eq!(ctx.signal(), None);
        assert_eq!(ctx.run(), Signal::Pending);
        assert_eq!(ctx.run(), Signal::Done(Value::I64(n * 2)));
        assert_eq!(ctx.value(), Some(Value::I64(n * 2)));
    }
}

#[test]
fn suspend_with_io_conditions() {
    let mut ctx = Context::bind(|s, ()| {
        s.suspend_with(Suspend::IoEof);
        s.suspend_with(Suspend::IoClosed);
        s.suspend_with(Suspend::default());
    })
    .unwrap();

    ctx.setup(());
    assert_eq!(ctx.run(), Signal::IoEof);
    assert_eq!(ctx.run(), Signal::IoClosed);
    assert_eq!(ctx.run(), Signal::Pending);
    assert_eq!(ctx.state(), State::Suspended);
    assert!(ctx.run().as_done().is_some());
}

#[test]
fn pointer_value() {
    let mut ctx = Context::bind(|_, val: u32| Box::into_raw(Box::new(val))).unwrap();
    ctx.setup(99);
    let ptr = ctx.run().as_done().and_then(Value::as_ptr).unwrap();
    let boxed = unsafe { Box::from_raw(ptr as *mut u32) };
    assert_eq!(*boxed, 99);
}

#[test]
fn interleaved_contexts() {
    fn counter(s: &crate::Suspender, start: u64) -> u64 {
        let mut local = start;
        for _ in 0..3 {
            local += 1;
            s.suspend();
        }
        local
    }

    let mut a = Context::bind(counter).unwrap();
    let mut b = Context::bind(counter).unwrap();
    a.setup(100);
    b.setup(200);

    for _ in 0..3 {
        assert_eq!(a.run(), Signal::Pending);
        assert_eq!(b.run(), Signal::Pending);
    }
    assert_eq!(b.run(), Signal::Done(Value::U64(203)));
    assert_eq!(a.run(), Signal::Done(Value::U64(103)));
}

#[test]
fn nested_contexts() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let log2 = log.clone();
    let mut outer = Context::bind(move |s, ()| {
        let log3 = log2.clone();
        let mut inner = Context::bind(move |s, ()| {
            log3.borrow_mut().push("inner 1");
            s.suspend();
            log3.borrow_mut().push("inner 2");
        })
        .unwrap();

        inner.setup(());
        assert_eq!(inner.run(), Signal::Pending);
        log2.borrow_mut().push("outer");
        s.suspend();
        assert!(inner.run().as_done().is_some());
    })
    .unwrap();

    outer.setup(());
    assert_eq!(outer.run(), Signal::Pending);
    assert!(outer.run().as_done().is_some());
    assert_eq!(*log.borrow(), ["inner 1", "outer", "inner 2"]);
}

#[test]
fn contexts_on_threads() {
    let handles: Vec<_> = (0..4u64)
        .map(|id| {
            thread::spawn(move || {
                let mut ctx = Builder::new()
                    .name(format!("thread-{}", id))
                    .bind(|s, n: u64| {
                        let mut sum = 0;
                        for i in 0..n {
                            sum += i;
                            s.suspend();
                        }
                        sum
                    })
                    .unwrap();
                ctx.setup(id * 10);
                while ctx.run().is_pending() {}
                ctx.value().unwrap().as_u64()
            })
        })
        .collect();

    for (id, handle) in handles.into_iter().enumerate() {
        let n = id as u64 * 10;
        assert_eq!(handle.join().unwrap(), n * n.saturating_sub(1) / 2);
    }
}

#[test]
fn deep_recursion() {
    #[inline(never)]
    fn recurse(depth: u32, s: &crate::Suspender) -> u32 {
        let buf = [depth as u8; 64];
        if depth == 0 {
            s.suspend();
            return 0;
        }
        std::hint::black_box(&buf);
        recurse(depth - 1, s) + u32::from(buf[0] == depth as u8)
    }

    let mut ctx = Context::bind(|s, depth: u32| recurse(depth, s)).unwrap();
    ctx.setup(1000);
    assert_eq!(ctx.run(), Signal::Pending);
    assert_eq!(ctx.run(), Signal::Done(Value::U64(1000)));
}

#[test]
fn heap_stack() {
    let stack = HeapStack::new(MIN_STACK_SIZE * 4).unwrap();
    let mut ctx = Context::bind_with_stack(stack, |s, x: i64| {
        s.suspend();
        -x
    });
    ctx.setup(5);
    assert_eq!(ctx.run(), Signal::Pending);
    assert_eq!(ctx.run(), Signal::Done(Value::I64(-5)));
    assert!(ctx.stack().check());
}

#[test]
fn into_stack_and_rebind() {
    let ctx = Context::<()>::bind(|_, ()| 1).unwrap();
    let stack = ctx.into_stack();

    let mut ctx = Context::bind_with_stack(stack, |_, ()| 2);
    ctx.setup(());
    assert_eq!(ctx.run(), Signal::Done(Value::I64(2)));
    let stack = ctx.into_stack();

    let mut ctx = Context::bind_with_stack(stack, |_, ()| 3);
    ctx.setup(());
    assert_eq!(ctx.run(), Signal::Done(Value::I64(3)));
}

#[test]
#[should_panic(expected = "cannot extract the stack of a suspended coroutine")]
fn into_stack_while_suspended() {
    let mut ctx = Context::bind(|s, ()| s.suspend()).unwrap();
    ctx.setup(());
    ctx.run();
    ctx.into_stack();
}

#[test]
fn teardown_unwinds_suspended_body() {
    for fail in [false, true] {
        let dropped = Rc::new(Cell::new(false));
        let mut ctx = Context::bind(|s, (guard, fail): (SetOnDrop, bool)| -> () {
            let _guard = guard;
            if fail {
                s.fail(io::ErrorKind::BrokenPipe.into());
            }
            s.suspend();
        })
        .unwrap();

        ctx.setup((SetOnDrop(dropped.clone()), fail));
        ctx.run();
        assert!(!dropped.get());
        ctx.teardown().unwrap();
        assert!(dropped.get());
    }
}

#[test]
fn drop_unwinds_suspended_body() {
    let dropped = Rc::new(Cell::new(false));
    let mut ctx = Context::bind(|s, guard: SetOnDrop| {
        let _guard = guard;
        s.suspend_with(Suspend::IoEof);
    })
    .unwrap();

    ctx.setup(SetOnDrop(dropped.clone()));
    assert_eq!(ctx.run(), Signal::IoEof);
    drop(ctx);
    assert!(dropped.get());
}

/// Returns the permissions of the mapping containing `addr`.
#[cfg(all(target_os = "linux", feature = "default-stack"))]
fn mapping_perms(addr: usize) -> Option<String> {
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if (start..end).contains(&addr) {
            fields.next().map(str::to_owned)
        } else {
            None
        }
    })
}

/// Whether a guard-page stack is still mapped at `limit..base`.
#[cfg(all(target_os = "linux", feature = "default-stack"))]
fn stack_mapped(limit: usize, base: usize) -> bool {
    let guard = mapping_perms(limit);
    let top = mapping_perms(base - 1);
    guard.map_or(false, |p| p.starts_with("---")) && top.map_or(false, |p| p.starts_with("rw"))
}

#[cfg(all(target_os = "linux", feature = "default-stack"))]
#[test]
fn teardown_unmaps_suspended_and_failed() {
    use crate::stack::{page_size, DEFAULT_STACK_SIZE};

    for fail in [false, true] {
        // An unusual size so no other test maps the same range in between.
        let mut ctx = Builder::new()
            .stack_size(DEFAULT_STACK_SIZE + 3 * page_size())
            .bind(|s, fail: bool| -> () {
                if fail {
                    s.fail(io::ErrorKind::BrokenPipe.into());
                }
                s.suspend();
            })
            .unwrap();

        ctx.setup(fail);
        let expected = if fail {
            Signal::SysError
        } else {
            Signal::Pending
        };
        assert_eq!(ctx.run(), expected);

        let limit = ctx.stack().limit().get();
        let base = ctx.stack().base().get();
        assert!(stack_mapped(limit, base));
        ctx.teardown().unwrap();
        assert!(!stack_mapped(limit, base), "stack still mapped after teardown");
    }
}

#[test]
fn run_loop_stops_at_sys_error() {
    let mut ctx = Context::bind(|s, ()| -> () {
        s.suspend();
        s.fail(io::ErrorKind::ConnectionReset.into());
    })
    .unwrap();

    ctx.setup(());
    let mut runs = 0;
    let signal = loop {
        runs += 1;
        let signal = ctx.run();
        if !signal.is_pending() {
            break signal;
        }
    };
    assert_eq!(runs, 2);
    assert_eq!(signal, Signal::SysError);
    assert!(ctx.is_pending());
}

#[test]
fn force_teardown() {
    let dropped = Rc::new(Cell::new(false));
    let mut ctx = Context::bind(|s, guard: SetOnDrop| {
        let _guard = guard;
        s.suspend();
    })
    .unwrap();
    ctx.setup(SetOnDrop(dropped.clone()));
    assert_eq!(ctx.run(), Signal::Pending);
    unsafe { ctx.force_teardown().unwrap() };

    // The body was not unwound.
    assert!(!dropped.get());
}

#[test]
fn pending_argument_dropped_on_teardown() {
    let dropped = Rc::new(Cell::new(false));
    let mut ctx = Context::bind(|_, _guard: SetOnDrop| ()).unwrap();
    ctx.setup(SetOnDrop(dropped.clone()));
    assert!(!dropped.get());
    drop(ctx);
    assert!(dropped.get());
}

#[test]
fn stack_too_small() {
    match Builder::new().stack_size(16).bind(|_, ()| ()) {
        Err(crate::Error::StackTooSmall { size, min }) => {
            assert_eq!(size, 16);
            assert_eq!(min, MIN_STACK_SIZE);
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn debug_format() {
    let ctx = Builder::new().name("dbg").bind(|_, ()| ()).unwrap();
    let text = format!("{:?}", ctx);
    assert!(text.contains("\"dbg\""));
    assert!(text.contains("Idle"));
}

#[test]
fn backtrace_traces_to_host() {
    #[inline(never)] // try to get this to show up in backtraces
    fn look_for_me() {
        run_test();
    }
    fn assert_contains_host() {
        let trace = backtrace::Backtrace::new();
        println!("{:?}", trace);
        assert!(trace
            .frames()
            .iter()
            .flat_map(|f| f.symbols())
            .filter_map(|s| Some(s.name()?.to_string()))
            .any(|s| s.contains("look_for_me")));
    }

    fn run_test() {
        assert_contains_host();
        let mut ctx = Context::bind(move |s, ()| {
            assert_contains_host();
            s.suspend();
            assert_contains_host();
        })
        .unwrap();
        ctx.setup(());
        assert_eq!(ctx.run(), Signal::Pending);
        assert!(ctx.run().as_done().is_some());
    }

    look_for_me();
}
