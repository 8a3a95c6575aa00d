//! Durable, replayable event streams for long-running executions.
//!
//! Every execution owns an ordered, bounded buffer of sequence-numbered
//! events. Subscribers attach with the last sequence they saw, receive the
//! retained backlog, then follow live events until a terminal event closes
//! the stream.
//!
//! # Main types
//!
//! - [`ExecutionHub`]: Owns every [`PersistentExecution`] and fans events out to subscribers.
//! - [`EventBuffer`]: Bounded per-execution log with gap-free sequence numbers.
//! - [`StreamItem`]: What a subscriber observes: events, keepalives and gap signals.
//! - [`ExecutionStore`]: Optional durable store, written behind the in-memory path.

/// Bounded, sequence-numbered event log.
pub mod buffer;
/// Execution registry and event fan-out.
pub mod hub;
/// Durable execution store and its write-behind writer.
pub mod store;
/// Subscriber-side replay-then-follow streams.
pub mod subscription;
/// Execution, event and stream item types.
pub mod types;

pub use buffer::{EventBuffer, Replay};
pub use hub::{ExecutionHub, ExecutionSnapshot, StreamConfig};
pub use store::{ExecutionStore, FileExecutionStore, StoreWriter};
pub use subscription::EventStream;
pub use types::{event_types, BufferedEvent, ExecutionStatus, PersistentExecution, StreamItem};
