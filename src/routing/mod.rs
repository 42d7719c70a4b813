//! Shard routing for ticket inventory.
//!
//! Every ticket type's stock is split into shards. A buyer is mapped to a
//! primary shard by hashing `(user_id, event_id)`; a multi-shard acquisition
//! scans from the primary shard onward, wrapping around.
//!
//! ```text
//!   (user 7, event 1) ──xxhash──► primary = 3
//!
//!   shard:  0   1   2  [3]  4
//!   scan:   3 → 4 → 0 → 1 → 2
//! ```
//!
//! Events also map to a coarser physical partition, used only for data
//! placement.

mod router;

pub use router::{split_evenly, Placement, ShardRouter};
