//! A coroutine that keeps a running total across suspensions: each resume
//! feeds it one sample, each yield reports the sum so far, and returning
//! hands back the final average.

use coswitch::{Coroutine, CoroutineResult};

fn main() {
    let samples = [3u64, 9, 4, 10, 7];

    let mut accumulator = Coroutine::<u64, u64, f64>::new(|yielder, first| {
        let mut total = first;
        let mut count = 1;
        while count < 5 {
            total += yielder.suspend(total);
            count += 1;
        }
        total as f64 / count as f64
    });

    let mut feed = samples.iter();
    let mut next = *feed.next().unwrap();
    loop {
        match accumulator.resume(next) {
            CoroutineResult::Yield(total) => {
                println!("running total: {}", total);
                next = *feed.next().unwrap();
            }
            CoroutineResult::Return(mean) => {
                println!("mean of {} samples: {}", samples.len(), mean);
                break;
            }
        }
    }

    assert!(accumulator.is_done());
    println!("accumulator finished");
}

#[test]
fn basic() {
    main()
}
