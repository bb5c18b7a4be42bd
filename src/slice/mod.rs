//! Derived views of the published tables: per-key partitions of the main table, the
//! latest row of every key, and per-location breakouts with their aggregated main tables.

pub mod latest;
pub mod location;
pub mod partition;

pub use latest::latest_subsets;
pub use location::{publish_location_aggregates, publish_location_breakouts};
pub use partition::partition_by_key;
