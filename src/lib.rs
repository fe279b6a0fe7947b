//! An append-oriented filesystem stored as fixed-size tagged blocks in a
//! single container file or RAM buffer, mounted through FUSE.
//!
//! Every mutation appends a tagged block carrying a monotonically increasing
//! sequence number; nothing is edited in place. Mounting replays the
//! container in sequence order to rebuild the live state, and a bounded
//! container supports unlimited churn by lazily reusing stale blocks.

pub mod error;
pub mod fs;
pub mod fuse;
pub mod index;
pub mod io;
pub mod table;
