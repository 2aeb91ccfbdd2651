//! One ingesting thread racing concurrent readers on a shared engine.
//!
//! Run with: `cargo test --test lock_contention`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use place_matcher::{
    ClusteringConfig, ClusteringEngine, MemoryRowStore, PositionSample, UNKNOWN_PLACE,
    EARTH_RADIUS_METERS,
};

const T0: i64 = 1_700_000_000;

fn north_of(origin: (f64, f64), meters: f64) -> (f64, f64) {
    (origin.0 + (meters / EARTH_RADIUS_METERS).to_degrees(), origin.1)
}

#[test]
fn test_readers_see_consistent_state_while_ingesting() {
    let _ = env_logger::builder().is_test(true).try_init();

    let engine = Arc::new(
        ClusteringEngine::new(MemoryRowStore::new(), ClusteringConfig::default()).unwrap(),
    );
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            // Ten 15-minute stays, each 1km further north.
            let origin = (48.8566, 2.3522);
            let mut t = T0;
            for stop in 0..10 {
                let pos = north_of(origin, stop as f64 * 1000.0);
                for _ in 0..90 {
                    engine
                        .ingest(&PositionSample::new(pos.0, pos.1, t))
                        .expect("ingest failed");
                    t += 10;
                }
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut max_seen = 0;
                while !done.load(Ordering::SeqCst) {
                    let names = engine.list_place_names();
                    // Places only ever get added during ingestion.
                    assert!(names.len() >= max_seen);
                    max_seen = names.len();

                    let place = engine.lookup_place();
                    assert!(place == UNKNOWN_PLACE || place.starts_with("place-"));

                    let stats = engine.stats();
                    assert!(!stats.halted);
                    assert_eq!(stats.place_count as u64, stats.last_place_number);
                }
                max_seen
            })
        })
        .collect();

    writer.join().expect("writer panicked");
    for reader in readers {
        let seen = reader.join().expect("reader panicked");
        assert!(seen <= 10);
    }

    let names = engine.list_place_names();
    assert!(names.len() >= 9, "expected most stays promoted, got {}", names.len());
    let numbers: Vec<u64> = engine
        .places()
        .iter()
        .filter_map(|p| p.place_id())
        .map(|id| id.number())
        .collect();
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
}
