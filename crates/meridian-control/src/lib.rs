//! Meridian Coordinator
//!
//! Hub registration, token issuance on behalf of hubs and operators,
//! distribution of the hub TLS certificate, flow report ingestion, and the
//! single listener that serves both the RPC and plain HTTP surfaces.

pub mod error;
pub mod flows;
pub mod housekeeping;
pub mod http;
pub mod hubs;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod service;
pub mod tls;

pub use error::{ControlError, ControlResult};
pub use flows::{FlowAggregator, FlowTotals};
pub use housekeeping::{register_activity_cleanup, CLEANUP_ACTIVITY_JOB};
pub use http::{http_router, render_metrics};
pub use hubs::HubRegistry;
pub use metrics::{ControlMetrics, MetricsError, MetricsResult};
pub use rpc::rpc_router;
pub use server::{is_rpc_request, ControlServer, ControlState, FrontDoor, ServerConfig};
pub use service::{ControlConfig, ControlService};
pub use tls::{hub_domain, refresh_once, run_tls_refresh, HubTls};
