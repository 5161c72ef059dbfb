//! Collector orchestration
//!
//! Two threads connected by a channel: a reader that pulls frames from the
//! source and runs the sampling engine, and a writer that persists the
//! emitted batches. The reader owns the engine outright, so decoding needs
//! no locks; the store is behind its own mutex and shared with the drain
//! path.
//!
//! Shutdown is cooperative. The reader's source reads time out, so setting
//! the stop flag is enough to bring it around; it runs one last expiry
//! check on the way out and drops its channel sender, which lets the
//! writer drain the queue and exit. If the reader wedges inside a read,
//! `stop` gives up after a grace period and tells the writer to leave
//! without it.

use crate::source::FrameSource;
use crate::store::Store;
use anyhow::{anyhow, Result};
use can_telemetry_core::sampler::SamplingEngine;
use can_telemetry_core::signals::SignalDatabase;
use can_telemetry_core::types::Batch;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long `stop` waits for the reader's final flush before giving up
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How often the writer wakes to check the abandon flag
const WRITER_POLL: Duration = Duration::from_millis(500);

pub struct Collector {
    stop: Arc<AtomicBool>,
    abandon: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<()>>,
}

impl Collector {
    /// Spawn the reader and writer threads and start sampling immediately.
    pub fn start(
        db: Arc<SignalDatabase>,
        source: Box<dyn FrameSource>,
        store: Arc<Store>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Batch>();
        let stop = Arc::new(AtomicBool::new(false));
        let abandon = Arc::new(AtomicBool::new(false));

        let reader = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || reader_loop(db, source, tx, stop))
        };
        let writer = {
            let abandon = Arc::clone(&abandon);
            thread::spawn(move || writer_loop(rx, store, abandon))
        };

        Self {
            stop,
            abandon,
            reader,
            writer,
        }
    }

    /// Stop both threads, waiting for the reader's final expiry check and
    /// the writer's queue drain. Returns the writer's fatal storage error,
    /// if it hit one.
    pub fn stop(self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);

        let deadline = Instant::now() + STOP_GRACE;
        while !self.reader.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        if self.reader.is_finished() {
            let _ = self.reader.join();
        } else {
            // Stuck in a read that should have timed out; leave the thread
            // behind and release the writer.
            log::warn!("frame reader did not stop in time, abandoning final flush");
            self.abandon.store(true, Ordering::Relaxed);
        }
        self.writer
            .join()
            .unwrap_or_else(|_| Err(anyhow!("record writer panicked")))
    }
}

fn reader_loop(
    db: Arc<SignalDatabase>,
    mut source: Box<dyn FrameSource>,
    sink: mpsc::Sender<Batch>,
    stop: Arc<AtomicBool>,
) {
    let mut engine = SamplingEngine::new(db, sink);
    engine.start(Utc::now());
    log::info!("frame reader started");

    while !stop.load(Ordering::Relaxed) {
        match source.read_frame() {
            Ok(Some((frame, ts))) => engine.ingest_frame(&frame, ts),
            Ok(None) => {}
            Err(e) => {
                log::error!("frame source failed: {:#}", e);
                break;
            }
        }
        engine.check_expiry(Utc::now());
    }

    // One last expiry check; samples inside a still-open grid cell stay
    // unflushed (at-most-once handoff per window)
    engine.check_expiry(Utc::now());
    log::info!("frame reader stopped");
}

fn writer_loop(
    rx: mpsc::Receiver<Batch>,
    store: Arc<Store>,
    abandon: Arc<AtomicBool>,
) -> Result<()> {
    log::info!("record writer started");

    loop {
        match rx.recv_timeout(WRITER_POLL) {
            Ok(batch) => {
                log::debug!("persisting {} records", batch.len());
                // Busy contention retries inside insert_batch; anything
                // that reaches this point is a fatal storage fault
                if let Err(e) = store.insert_batch(&batch) {
                    log::error!("record writer terminating: {:#}", e);
                    return Err(e);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if abandon.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("record writer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use can_telemetry_core::model3;
    use can_telemetry_core::types::{CanFrame, ChannelKey, Timestamp};
    use std::collections::VecDeque;

    struct ScriptedSource {
        frames: VecDeque<(CanFrame, Timestamp)>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<(CanFrame, Timestamp)>) -> Self {
            Self {
                frames: frames.into(),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Option<(CanFrame, Timestamp)>> {
            match self.frames.pop_front() {
                Some(next) => Ok(Some(next)),
                None => {
                    // Behaves like a quiet bus: reads keep timing out
                    thread::sleep(Duration::from_millis(5));
                    Ok(None)
                }
            }
        }
    }

    #[test]
    fn test_frames_reach_the_store_at_the_window_boundary() {
        use can_telemetry_core::sampler::{next_boundary, SHORT_WINDOW_MS};

        let db = Arc::new(model3().unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();
        let source = ScriptedSource::new(vec![
            // Raw 1125 -> 50 km/h
            (
                CanFrame::new(0x257, vec![0x00, 0x50, 0x46, 0x00, 0x02, 0x00, 0x00, 0x00]),
                now,
            ),
        ]);

        let collector = Collector::start(db, Box::new(source), Arc::clone(&store));

        // Run past the next real short boundary so the reader's expiry
        // checks emit the batch
        let wait = (next_boundary(Utc::now(), SHORT_WINDOW_MS) - Utc::now())
            .num_milliseconds()
            .max(0) as u64
            + 200;
        thread::sleep(Duration::from_millis(wait));
        collector.stop().unwrap();

        let mut values = std::collections::BTreeMap::new();
        while let Some(batch) = store.take_oldest().unwrap() {
            values.extend(batch.values);
        }
        assert_eq!(values[&ChannelKey::SPEED.0], 50.0);
        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_stop_on_quiet_bus_terminates_cleanly() {
        let db = Arc::new(model3().unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let source = ScriptedSource::new(Vec::new());

        let collector = Collector::start(db, Box::new(source), Arc::clone(&store));
        thread::sleep(Duration::from_millis(50));
        collector.stop().unwrap();

        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_writer_terminates_on_fatal_store_error() {
        use can_telemetry_core::types::Record;

        let store = Arc::new(Store::open_in_memory().unwrap());
        store.drop_schema();

        let (tx, rx) = mpsc::channel();
        let abandon = Arc::new(AtomicBool::new(false));
        let writer = {
            let store = Arc::clone(&store);
            let abandon = Arc::clone(&abandon);
            thread::spawn(move || writer_loop(rx, store, abandon))
        };

        tx.send(vec![Record {
            timestamp: Utc::now(),
            channel: ChannelKey::SPEED,
            value: 50.0,
        }])
        .unwrap();

        // A non-busy insert failure ends the loop with the error instead
        // of swallowing it
        let result = writer.join().unwrap();
        assert!(result.is_err());
    }
}
