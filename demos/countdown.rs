use std::cell::Cell;
use std::rc::Rc;

use stackful_coro::{Context, Signal};

fn main() {
    println!("[main] binding coroutine");
    let mut ctx = Context::bind(|s, counter: Rc<Cell<u32>>| {
        println!("[coroutine] starting at {}", counter.get());
        while counter.get() > 0 {
            counter.set(counter.get() - 1);
            s.suspend();
        }
        println!("[coroutine] finished");
    })
    .unwrap();

    // The same context is reused for every round instead of binding anew.
    for start in [3, 5] {
        let counter = Rc::new(Cell::new(start));
        ctx.setup(counter.clone());

        loop {
            match ctx.run() {
                Signal::Pending => println!("[main] counter is {}", counter.get()),
                Signal::Done(val) => {
                    println!("[main] done with {:?}", val);
                    break;
                }
                other => panic!("unexpected signal {:?}", other),
            }
        }
    }

    ctx.teardown().unwrap();
    println!("[main] exiting");
}
