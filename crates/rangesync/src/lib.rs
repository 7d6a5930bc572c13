//! Range-based set reconciliation.
//!
//! Two parties each hold a set of `(timestamp, 32-byte id)` items and want
//! to learn which items the other side is missing, transferring bandwidth
//! proportional to the symmetric difference rather than the set sizes. The
//! [`Reconciler`] drives the dialogue over any [`Storage`]: a sealed sorted
//! array ([`VectorStorage`]), a mutable B+ tree held in memory
//! ([`BTreeMem`]) or in a host key-value map ([`BTreePersist`]), or a
//! windowed view of any of those ([`SubRange`]).
//!
//! ```ignore
//! let mut engine = Reconciler::new(0)?;
//! engine.bind_storage(&storage);
//! let mut msg = Some(engine.initiate()?);
//!
//! let (mut have, mut need) = (Vec::new(), Vec::new());
//! while let Some(query) = msg {
//!     let reply = relay.exchange(&query)?; // transport is the host's business
//!     msg = engine.reconcile_with_ids(&reply, &mut have, &mut need)?;
//! }
//! ```

mod encoding;
mod engine;
mod error;
mod frame;
mod storage;
mod types;

pub use engine::{Reconciler, PROTOCOL_VERSION};
pub use error::Error;
pub use storage::btree::mem::BTreeMem;
pub use storage::btree::persist::{BTreePersist, KvStore, MemKv};
pub use storage::subrange::SubRange;
pub use storage::vector::VectorStorage;
pub use storage::Storage;
pub use types::{Accumulator, Bound, Fingerprint, Id, Item, FINGERPRINT_SIZE, ID_SIZE};

pub type Result<T> = std::result::Result<T, error::Error>;
