use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use damage_batch::{Config, GlobalStatistics, WindowSource};

mod common;
use common::{feed_latency, init_log};

// Drives one window through a fixed sequence of events.
fn run(window: &WindowSource, start: Instant) -> Vec<f64> {
    let mut delays = Vec::new();
    for i in 0..50_u64 {
        let now = start + Duration::from_millis(i * 45);
        window.on_damage(now, 200 * 200);
        let latency = 0.005 + (i % 7) as f64 * 0.004;
        window.with_state(|s| {
            s.stats.record_damage_in_latency(now, 200 * 200, s.batch.delay, latency);
            s.stats.record_damage_out_latency(now, 200 * 200, s.batch.delay, latency * 2.0);
            s.batch.record_delay(now, s.batch.delay);
        });
        window.recalculate(now);
        delays.push(window.delay());
    }
    delays
}

fn global(start: Instant) -> Arc<GlobalStatistics> {
    let g = Arc::new(GlobalStatistics::new());
    let now = feed_latency(&g, start, 20, Duration::from_millis(10), Duration::from_millis(12));
    g.update_averages(now);
    g
}

#[test]
fn windows_recalculate_in_parallel() {
    init_log();

    let config = Config::new();
    let start = Instant::now();

    let sequential: Vec<Vec<f64>> = {
        let g = global(start);
        (1..=2)
            .map(|wid| run(&WindowSource::new(wid, (200, 200), &config, g.clone()), start))
            .collect()
    };

    let g = global(start);
    let windows: Vec<_> = (1..=2)
        .map(|wid| Arc::new(WindowSource::new(wid, (200, 200), &config, g.clone())))
        .collect();

    let handles: Vec<_> = windows
        .iter()
        .cloned()
        .map(|w| thread::spawn(move || run(&w, start)))
        .collect();
    let parallel: Vec<Vec<f64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(sequential, parallel);
    assert_eq!(g.info().damage_events, 100);
}

#[test]
fn shared_window_serializes() {
    init_log();

    let start = Instant::now();
    let g = global(start);
    let window = Arc::new(WindowSource::new(1, (200, 200), &Config::new(), g));

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let w = window.clone();
            thread::spawn(move || {
                for i in 0..25_u64 {
                    let now = start + Duration::from_millis(i * 10 + n);
                    w.on_damage(now, 1000);
                    w.recalculate(now);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let delay = window.delay();
    assert!(delay.is_finite());
    assert!(delay >= 0.0 && delay <= Config::new().batch().max_delay);
}
