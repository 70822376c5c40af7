#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use unfenced::{SetOperation, SkipList};

fuzz_target!(|ops: Vec<unfenced::SetOperation<u8>>| {
    let list = Arc::new(SkipList::new());

    let mut threads = vec![];

    let len = ops.len();

    for sub_ops in ops.chunks(std::cmp::max(len / 8, 1)) {
        let sub_ops = sub_ops.to_vec();
        let list = list.clone();

        threads.push(std::thread::spawn(move || {
            sub_ops.into_iter().for_each(|op| match op {
                SetOperation::Add { key } => {
                    list.add(key);
                }
                SetOperation::Remove { key } => {
                    list.remove(&key);
                }
                SetOperation::Contains { key } => {
                    list.contains(&key);
                }
            })
        }))
    }

    for thread in threads {
        thread.join().unwrap()
    }

    // whatever survived must still be sorted and duplicate free
    let keys = list.snapshot();
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1]);
    }
});
