//! A hash map with incrementally rehashed, bucketed storage.
//!
//! [`HashMap`] keeps its entries in fixed-size buckets with overflow
//! chaining and grows by migrating a couple of bucket chains per write,
//! bounding the latency of any single insert. Iterators start at a random
//! bucket and survive a grow in progress. See the [`HashMap`] documentation
//! for details and for the ways this map deliberately differs from
//! `std::collections::HashMap`.

mod map;
mod raw;

pub use map::{HashMap, IntoIter, Iter, Keys, Values};
