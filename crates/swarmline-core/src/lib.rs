//! Core types and error definitions for the Swarmline task runtime.
//!
//! This crate provides the foundational types shared across all Swarmline
//! crates: the unified error enum, the result alias, and the opaque payload
//! map used for task input and event bodies.
//!
//! # Main types
//!
//! - [`SwarmlineError`]: Unified error enum for scheduling, execution and streaming.
//! - [`SwarmlineResult`]: Convenience alias for `Result<T, SwarmlineError>`.
//! - [`Payload`]: Opaque key/value map carried by tasks and events.
//! - [`Tombstones`]: Bounded set of evicted ids.

/// Error taxonomy shared by every subsystem.
pub mod error;
/// Memory of evicted terminal ids.
pub mod tombstones;

pub use error::{SwarmlineError, SwarmlineResult};
pub use tombstones::Tombstones;

use std::collections::HashMap;

#[doc(hidden)]
pub use serde_json as __serde_json;

/// Opaque key/value map used for task input and event payloads.
pub type Payload = HashMap<String, serde_json::Value>;

/// Builds a [`Payload`] from `key => value` pairs.
///
/// ```
/// let p = swarmline_core::payload! { "attempt" => 2, "agent" => "coder" };
/// assert_eq!(p["attempt"], 2);
/// ```
#[macro_export]
macro_rules! payload {
    () => { $crate::Payload::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Payload::new();
        $( map.insert(($key).to_string(), $crate::__serde_json::json!($value)); )+
        map
    }};
}
