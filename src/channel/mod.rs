//! Bounded lock-free channels for the steal protocol.
//!
//! Two channel shapes carry the whole protocol:
//!
//! - [`MpscChannel`]: every peer may post a steal request to a worker
//!   (multiple producers), only that worker drains them (one consumer).
//! - [`SpscChannel`]: the worker satisfying a steal request replies on the
//!   originator's dedicated channel (one producer at a time, one consumer).
//!
//! Both expose the non-blocking `set`/`get` pair: `set` fails on a full
//! channel instead of waiting, `get` returns `None` on an empty one. The
//! scheduler never blocks on a channel; it sizes them so that `set` cannot
//! fail under the protocol invariants (requests capacity ≥ worker count,
//! reply capacity 1 with at most one outstanding request per worker).

pub mod mpsc;
pub mod spsc;

pub use mpsc::MpscChannel;
pub use spsc::SpscChannel;
