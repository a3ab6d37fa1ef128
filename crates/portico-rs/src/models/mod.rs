//! Data models and domain types for the portico gateway.
//!
//! This module contains the core data structures used throughout the
//! dispatch core: configuration models, routing and upstream descriptors,
//! policy shapes and the gateway error taxonomy. Models provide type
//! safety, serde support and validation; runtime behavior lives in the
//! service layer.
//!
//! # Module Organization
//!
//! - [`error`] - Gateway error taxonomy with HTTP response mapping
//! - [`http`] - Framework-independent request/response representation
//! - [`policy`] - Rate-limit, cache, retry, breaker and global policies
//! - [`route`] - Route match criteria, actions and per-route overlays
//! - [`settings`] - Root configuration document
//! - [`upstream`] - Upstream pools and backend runtime state

pub mod error;
pub mod http;
pub mod policy;
pub mod route;
pub mod settings;
pub mod upstream;
