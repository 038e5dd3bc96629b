//! A lock-free concurrent sorted map: the interpolation search tree of
//! Brown, Prokopec and Alistarh (PPoPP 2020), with cooperative amortized
//! subtree rebuilding and epoch-based reclamation.
//!
//! ```
//! use ist_map::IstMap;
//!
//! let map = IstMap::<u64, u64>::new();
//! let guard = crossbeam_epoch::pin();
//! map.insert(1, 10, &guard);
//! assert_eq!(map.get(&1, &guard), Some(10));
//! assert_eq!(map.remove(&1, &guard), Some(10));
//! ```

#[macro_use]
extern crate bitflags;

pub mod concurrent_map;
mod dcss;
mod ist;
mod multicounter;
mod node;
mod word;

pub use crate::concurrent_map::ConcurrentMap;
pub use crate::ist::{InlineValue, InterpolationKey, IstMap};
