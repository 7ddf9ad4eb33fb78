//! netwarden: device-local network traffic inspection and threat scoring
//!
//! Reads raw IP frames from a virtual interface, aggregates them into flows,
//! dissects DNS and TLS metadata, forwards traffic through real sockets to
//! keep connectivity, and scores every connection and flow against indicator
//! feeds, behavioral heuristics and reputation data.

pub mod bridge;
pub mod config;
pub mod core;
pub mod detect;
pub mod dissect;
pub mod error;
pub mod events;
pub mod flow;
pub mod heuristics;
pub mod intel;

pub use bridge::{ChannelDevice, Monitor, TunDevice};
pub use config::Config;
pub use detect::{DetectionEngine, DetectionMethod, ThreatAnalysis, ThreatLevel};
pub use error::{MonitorError, Result};
pub use events::MonitorEvent;
pub use flow::{Flow, FlowTracker, SharedFlowTracker};
pub use intel::{IocMatcher, ListStore, ReputationService};
