//! Security gateway
//!
//! Composes the Sanitization Engine, Query Guard, Tenant Isolation
//! Enforcer, Exfiltration Monitor and Audit Logger into one request
//! pipeline shared by the HTTP handlers and the CLI.

mod server;

pub use server::{GatewayState, SecurityGateway, SecurityGatewayBuilder};

#[cfg(test)]
pub(crate) use server::tests::{test_gateway, token_for};
