//! LiTL: low-overhead event tracing for instrumented programs.
//!
//! The write path records timestamped events from many threads into
//! per-thread buffers with no locks or syscalls on the hot path, spilling
//! full buffers to a single trace file whose header links every thread's
//! chunks into a chain an offline reader can walk in order.
//!
//! ```no_run
//! let mut trace = litl::Trace::init(512 * 1024);
//! trace.set_filename("/tmp/demo.trace");
//!
//! trace.probe0(0x101);
//! trace.probe2(0x102, 1, 3);
//! trace.raw_probe(0x103, b"checkpoint");
//! trace.finalize();
//!
//! let mut reader = litl::TraceReader::open("/tmp/demo.trace").unwrap();
//! while let Some(event) = reader.next_event().unwrap() {
//!     println!("{:x} at {}", event.code, event.time);
//! }
//! ```

pub mod clock;
pub mod config;
mod pack;
pub mod read;
pub mod types;
mod write;

pub use config::Config;
pub use pack::{PackParam, Packer};
pub use read::{Event, Payload, TraceReader};
pub use types::{Code, EventType, Param, Tid, Time, MAX_DATA, MAX_PARAMS, OFFSET_CODE};
pub use write::Trace;
