//! Hub agent
//!
//! Everything a hub needs from the Coordinator: learning its own network
//! locations, pulling configuration and TLS material, registering, and
//! keeping both in step until shutdown.

pub mod agent;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod error;
pub mod flows;
pub mod healthz;
pub mod hub;
pub mod listener;
pub mod locations;
pub mod shutdown;

pub use agent::{default_hub_name, Agent, AgentConfig, AgentStats, AgentStatsSnapshot};
pub use backoff::{retry, sleep_or_cancel, Backoff};
pub use cache::ConfigCache;
pub use client::{ClientConfig, ControlClient};
pub use error::{AgentError, AgentResult};
pub use flows::FlowTracker;
pub use healthz::{healthz_router, serve_healthz};
pub use hub::{serve_hub, HubPorts};
pub use listener::HubListener;
pub use locations::{
    build_locations, classify, discover_local_addrs, learn_locations, LocationConfig,
};
pub use shutdown::ShutdownStack;
