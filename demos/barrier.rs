use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chronus::Scheduler;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicUsize::new(0));

    for delay in [10, 20, 30] {
        let counter = Arc::clone(&counter);
        scheduler
            .schedule(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(delay),
            )
            .unwrap();
    }
    let answer = scheduler.submit_call(|| 6 * 7).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    println!(
        "Before await: counter = {}, held = {}",
        counter.load(Ordering::SeqCst),
        scheduler.held()
    );

    scheduler.await_tasks();
    println!("After await: counter = {}", counter.load(Ordering::SeqCst));
    println!("Answer: {:?}", answer.wait());
}
