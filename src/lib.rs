//! Tenantgate - a multi-tenant HTTP/HTTPS gateway
//!
//! One process hosts many tenants behind named listeners ("connectors") that can be
//! added and removed at runtime:
//! - Routes each request by connector, scheme, host, path and method
//! - Supports `{name}` path segments and trailing `*` wildcards
//! - Dispatches to application endpoint handlers, reverse proxies or static files
//! - Terminates TLS with certificates selected by SNI
//! - Registers and removes tenants atomically

pub mod catalog;
pub mod certs;
pub mod config;
pub mod connector;
pub mod error;
pub mod files;
pub mod gateway;
pub mod pool;
pub mod proxy;
pub mod tenancy;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
