//! Meridian protocol definitions
//!
//! Shared data model for the coordinator and hubs: stable ids, accounts,
//! capabilities, label sets, RPC messages and the framed RPC codec.

pub mod account;
pub mod discovery;
pub mod id;
pub mod labels;
pub mod messages;
pub mod rpc;

pub use account::{
    is_valid_namespace, namespace_contains, Account, Capability, ParseCapabilityError,
};
pub use discovery::{DiscoveryDocument, DiscoveryHub, DISCOVERY_PATH};
pub use id::{ParseIdError, StableId};
pub use labels::{Label, LabelSet, Location};
pub use messages::*;
pub use rpc::{decode_frame, encode_frame, methods, Code, FrameError, RpcStatus, RPC_CONTENT_TYPE};

/// Metadata key carrying bearer tokens on every RPC
pub const AUTHORIZATION_METADATA: &str = "authorization";
