//! Minibridge Core: transport-agnostic MCP bridging and policing library.
//!
//! This library provides the message model, the subprocess stream, the
//! session manager, the policers and the policing pipeline used by the
//! `minibridge` CLI, together with the in-memory transport, configuration
//! and telemetry plumbing they run on.

pub mod auth;
pub mod backend;
pub mod config;
pub mod framing;
pub mod identity;
pub mod mcp;
pub mod memconn;
pub mod pipeline;
pub mod policer;
pub mod process;
pub mod sbom;
pub mod scan;
pub mod session;
pub mod telemetry;
