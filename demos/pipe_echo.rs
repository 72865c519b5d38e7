//! Two coroutines connected by a pipe: a producer writes numbered lines and a
//! consumer echoes them, both waiting on the non-blocking descriptors while a
//! simple round-robin loop drives them.

use std::os::unix::io::RawFd;

use stackful_coro::io::{self, Transfer};
use stackful_coro::{Builder, Signal, Suspend};

fn main() {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        panic!("pipe: {}", std::io::Error::last_os_error());
    }
    let [rd, wr] = fds;
    io::set_nonblocking(rd).unwrap();
    io::set_nonblocking(wr).unwrap();

    let mut producer = Builder::new()
        .name("producer")
        .stack_size(256 * 1024)
        .bind(|s, fd: RawFd| {
            for i in 0..5 {
                let line = format!("line {}\n", i);
                match io::await_write(s, fd, line.as_bytes()) {
                    Transfer::Bytes(_) => s.suspend(),
                    Transfer::Closed | Transfer::Eof => s.suspend_with(Suspend::IoClosed),
                }
            }
            unsafe { libc::close(fd) };
        })
        .unwrap();

    let mut consumer = Builder::new()
        .name("consumer")
        .stack_size(256 * 1024)
        .bind(|s, fd: RawFd| {
            let mut buf = [0; 64];
            let mut total = 0;
            loop {
                match io::await_read(s, fd, &mut buf) {
                    Transfer::Bytes(n) => {
                        print!("[consumer] {}", String::from_utf8_lossy(&buf[..n]));
                        total += n;
                    }
                    Transfer::Eof => break,
                    Transfer::Closed => s.suspend_with(Suspend::IoClosed),
                }
            }
            unsafe { libc::close(fd) };
            total
        })
        .unwrap();

    producer.setup(wr);
    consumer.setup(rd);
    while producer.is_pending() || consumer.is_pending() {
        for ctx in [&mut producer, &mut consumer] {
            if !ctx.is_pending() {
                continue;
            }
            match ctx.run() {
                Signal::SysError => {
                    let err = ctx.take_error();
                    panic!("{} failed: {:?}", ctx.name(), err);
                }
                Signal::Done(val) => println!("[main] {} done with {:?}", ctx.name(), val),
                _ => {}
            }
        }
    }

    producer.teardown().unwrap();
    consumer.teardown().unwrap();
}
