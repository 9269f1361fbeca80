//! A buffer cache that gives memory back whenever a collection cycle is signaled.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slot_sync::{CollectionMonitor, Pool};

const BUFFER_SIZE: usize = 64 * 1024;

fn main() {
    let monitor = CollectionMonitor::builder()
        .probe_interval(Some(Duration::from_millis(100)))
        .build();

    let buffers = Arc::new(
        Pool::builder(16)
            .recycler(|buffer: &mut Vec<u8>| {
                buffer.clear();
                Ok(())
            })
            .build(),
    );

    // Trim half of the cached buffers on every cycle.
    monitor.subscribe(&buffers, |buffers| {
        let cached = buffers.count();

        for _ in 0..cached.div_ceil(2) {
            drop(buffers.try_get());
        }

        println!("trimmed cache from {cached} to {} buffers", buffers.count());
    });

    for round in 0..16 {
        let mut buffer = buffers.get_or_else(|| Vec::with_capacity(BUFFER_SIZE));
        buffer.resize(BUFFER_SIZE, u8::try_from(round).unwrap_or(u8::MAX));
        buffers.donate(buffer);
    }

    println!("cached {} buffers", buffers.count());

    monitor.notify_collected();
    thread::sleep(Duration::from_millis(350));

    monitor.shutdown();
    println!("{} collection cycles observed", monitor.cycles());
}
