#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use unfenced::{Operation, Queue, RingBuffer, Stack};

fuzz_target!(|ops: Vec<unfenced::Operation<i32>>| {
    let stack = Arc::new(Stack::new());
    let queue = Arc::new(Queue::new());
    let ring = Arc::new(RingBuffer::with_capacity(64));

    let mut threads = vec![];

    let len = ops.len();

    for sub_ops in ops.chunks(std::cmp::max(len / 8, 1)) {
        let sub_ops = sub_ops.to_vec();
        let stack = stack.clone();
        let queue = queue.clone();
        let ring = ring.clone();

        threads.push(std::thread::spawn(move || {
            sub_ops.into_iter().for_each(|op| match op {
                Operation::Push { item } => stack.push(item),
                Operation::Pop => {
                    stack.pop();
                }
                Operation::Enqueue { item } => queue.enqueue(item),
                Operation::Dequeue => {
                    queue.dequeue();
                }
                Operation::Offer { item } => {
                    ring.offer(item);
                }
                Operation::Poll => {
                    ring.poll();
                }
            })
        }))
    }

    for thread in threads {
        thread.join().unwrap()
    }

    assert!(ring.len() < ring.capacity());

    while stack.pop().is_some() {}
    while queue.dequeue().is_some() {}
    while ring.poll().is_some() {}
});
