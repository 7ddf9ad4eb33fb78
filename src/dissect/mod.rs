//! Protocol dissectors
//!
//! Best-effort parsers for the application payloads the monitor cares about.
//! Both return `Option`; a payload that is not the expected protocol is simply
//! not a parse result, never an error.

pub mod dns;
pub mod tls;
