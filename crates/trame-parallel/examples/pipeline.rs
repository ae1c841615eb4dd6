//! Démo: séquence paresseuse → pool → consommateur, avec contre-pression.
//!
//! `RUST_LOG=trace cargo run --example pipeline`

use trame_channel::mpsc;
use trame_parallel::{par_each, ParConfig, ThreadPool};
use trame_threads::spawn;

fn main() {
    env_logger::init();

    let pool = ThreadPool::with_num_cpus(64);
    let (tx, rx) = mpsc::channel::<u64>(128);
    let consumer = spawn(move || {
        let mut total = 0u64;
        while let Some(v) = rx.recv() {
            total += v;
        }
        total
    });

    let cfg = ParConfig::with_hint(&pool, 100_000);
    let ok = par_each(0..100_000u64, &pool, cfg, move |x| {
        let _ = tx.send(x * x);
    });
    assert!(ok);

    println!("somme des carrés: {}", consumer.join());
    pool.shutdown();
}
