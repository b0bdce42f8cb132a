use coswitch::{Coroutine, CoroutineResult};

fn main() {
    let mut fib = Coroutine::<(), u64, &'static str>::new(|yielder, ()| {
        let (mut a, mut b) = (0u64, 1u64);
        loop {
            if a > u64::MAX - b {
                return "next term would overflow a u64";
            }
            yielder.suspend(a);
            let sum = a + b;
            a = b;
            b = sum;
        }
    });

    for _ in 0..20 {
        match fib.resume(()) {
            CoroutineResult::Yield(n) => println!("{}", n),
            CoroutineResult::Return(msg) => {
                println!("generator stopped: {}", msg);
                break;
            }
        }
    }

    // The generator is still suspended mid-loop; dropping the handle
    // releases its stack without running the rest of the body.
}

#[test]
fn fibonacci() {
    main()
}
