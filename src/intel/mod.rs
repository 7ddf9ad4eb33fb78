//! Threat intelligence
//!
//! Indicator matching (exact IPs, CIDR ranges, regex patterns), a Bloom
//! pre-filter over known-bad values, operator allow/block lists, and the
//! reputation lookup layer with its cache and graceful degradation.

pub mod bloom;
pub mod ioc;
pub mod lists;
pub mod reputation;

pub use bloom::BloomFilter;
pub use ioc::{IocMatch, IocMatcher};
pub use lists::{EntryType, ListEntry, ListStore};
pub use reputation::{
    is_private_ip, ReputationProvider, ReputationReport, ReputationService, StaticProvider,
};
