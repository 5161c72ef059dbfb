//! CAN Telemetry Core Library
//!
//! A reusable library for turning a live CAN frame stream into windowed
//! telemetry records: bit-level frame decoding against a signal descriptor
//! table, multiplexed message resolution, per-channel statistics over fixed
//! time windows and a small set of derived channels.
//!
//! # Architecture
//!
//! This library is intentionally minimal and focused on decoding and
//! aggregation:
//! - Extracts raw bit fields from packed 8-byte payloads
//! - Resolves which signals a frame carries, including multiplexer groups
//! - Accumulates raw samples per channel and exposes scaled statistics
//! - Flushes record batches on short (5 s) and long (60 s) window grids
//!
//! The library does NOT:
//! - Read frames from a CAN socket
//! - Persist records
//! - Serve query traffic
//!
//! All of that lives in the application layer (can-telemetry-daemon).
//!
//! # Example Usage
//!
//! ```no_run
//! use can_telemetry_core::{model3, CanFrame, SamplingEngine};
//! use chrono::Utc;
//! use std::sync::{mpsc, Arc};
//!
//! let db = Arc::new(model3().unwrap());
//! let (tx, rx) = mpsc::channel();
//! let mut engine = SamplingEngine::new(db, tx);
//! engine.start(Utc::now());
//!
//! // Feed frames as they arrive, checking window expiry as time passes
//! let frame = CanFrame::new(0x257, vec![0x00, 0x50, 0x46, 0x00, 0x02]);
//! engine.ingest_frame(&frame, Utc::now());
//! engine.check_expiry(Utc::now());
//!
//! for batch in rx.try_iter() {
//!     for record in batch {
//!         println!("{} {:?} = {}", record.timestamp, record.channel, record.value);
//!     }
//! }
//! ```

// Public modules
pub mod accumulator;
pub mod codec;
pub mod sampler;
pub mod signals;
pub mod types;

// Re-export main types for convenience
pub use accumulator::Accumulator;
pub use sampler::{SamplingEngine, LONG_WINDOW_MS, SHORT_WINDOW_MS};
pub use signals::model3::model3;
pub use signals::{MessageDefinition, MuxGroup, SignalDatabase, SignalDefinition, ValueType};
pub use types::{Batch, CanFrame, ChannelKey, Record, Result, TelemetryError, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
