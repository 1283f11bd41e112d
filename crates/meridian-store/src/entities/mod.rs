//! Database entities

pub mod activity_log;
pub mod capability_token;
pub mod hub;
pub mod job;
pub mod lease;
pub mod secret;

pub use activity_log::Entity as ActivityLog;
pub use capability_token::Entity as CapabilityToken;
pub use hub::Entity as Hub;
pub use job::Entity as Job;
pub use lease::Entity as Lease;
pub use secret::Entity as Secret;
