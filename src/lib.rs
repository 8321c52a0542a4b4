//! FluidMCP Library
//!
//! Local gateway for Model Context Protocol servers. Supervises stdio MCP
//! children and re-exposes each as an HTTP surface, with per-package OAuth
//! (PKCE) termination, a health-checked pool of LLM backends, and a
//! persistent server-configuration store.
//! This library can be embedded in other applications.

pub mod auth;
pub mod child;
pub mod config;
pub mod error;
pub mod http;
pub mod llm;
pub mod logs;
pub mod registry;
pub mod supervisor;
pub mod tools;
pub mod types;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use http::Gateway;
