//! HTTP handlers for identity-service.

pub mod account;
pub mod device;
pub mod metrics;
pub mod session;
