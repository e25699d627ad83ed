//! DNS query filtering module.
//!
//! Decides which queries are answered locally instead of being forwarded
//! to the upstream resolver.

mod overrides;

pub use overrides::OverrideTable;
