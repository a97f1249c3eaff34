//! Liveness timestamps.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    time::{Duration, Instant},
};

fn clock_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// A liveness timestamp that only moves forward.
///
/// Stored as an offset from a process-wide anchor so it can be updated atomically from whichever thread observes
/// progress. Concurrent beats resolve to the latest one, never to an earlier value.
#[derive(Debug)]
pub struct Heartbeat {
    offset_nanos: AtomicU64,
}

impl Heartbeat {
    /// Creates a new `Heartbeat` that has just beaten.
    pub fn new() -> Self {
        let heartbeat = Self {
            offset_nanos: AtomicU64::new(0),
        };
        heartbeat.beat();
        heartbeat
    }

    /// Records progress at the current time and returns the recorded timestamp.
    pub fn beat(&self) -> Instant {
        let now = Instant::now();
        let offset = now.saturating_duration_since(clock_anchor()).as_nanos() as u64;
        let previous = self.offset_nanos.fetch_max(offset, Ordering::AcqRel);
        clock_anchor() + Duration::from_nanos(previous.max(offset))
    }

    /// Time of the latest beat.
    pub fn last(&self) -> Instant {
        clock_anchor() + Duration::from_nanos(self.offset_nanos.load(Ordering::Acquire))
    }

    /// Time elapsed since the latest beat.
    pub fn elapsed(&self) -> Duration {
        self.last().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn beats_never_move_backwards() {
        let heartbeat = Arc::new(Heartbeat::new());
        let handles = (0..4)
            .map(|_| {
                let heartbeat = Arc::clone(&heartbeat);
                thread::spawn(move || {
                    let mut previous = heartbeat.last();
                    for _ in 0..1000 {
                        heartbeat.beat();
                        let current = heartbeat.last();
                        assert!(current >= previous);
                        previous = current;
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn elapsed_tracks_latest_beat() {
        let heartbeat = Heartbeat::new();
        thread::sleep(Duration::from_millis(20));
        assert!(heartbeat.elapsed() >= Duration::from_millis(20));

        heartbeat.beat();
        assert!(heartbeat.elapsed() < Duration::from_millis(20));
    }
}
