//! Handing results from a worker thread to a waiting thread with one reusable promise.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use slot_sync::Promise;

const ATTEMPTS: usize = 3;

fn main() {
    let (promise, promised) = Promise::<String>::pending();

    // Separates rounds: the consumer has read the result, then the producer has released it.
    let round = Arc::new(Barrier::new(2));

    let worker = thread::spawn({
        let round = Arc::clone(&round);

        move || {
            for attempt in 1..=ATTEMPTS {
                thread::sleep(Duration::from_millis(10));

                if attempt < ATTEMPTS {
                    promised.on_error(format!("attempt {attempt} failed"));
                } else {
                    promised.on_completed();
                }

                round.wait();
                promised.release();
                round.wait();
            }
        }
    });

    for _ in 0..ATTEMPTS {
        promise.wait();

        match promise.error() {
            Some(error) => println!("worker reported: {error}"),
            None => println!("worker finished: {promise}"),
        }

        round.wait();
        round.wait();
    }

    worker.join().unwrap();
}
