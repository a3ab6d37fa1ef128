//! # Portico API Gateway
//!
//! A programmable L7 API gateway built with Rust and Actix Web. The crate
//! implements the request-dispatch core: a two-tier route matcher, a
//! compiled per-route stage pipeline, an upstream dispatcher with
//! retries, hedging, outlier ejection and circuit breaking, a
//! fingerprinted response cache with single-flight coalescing, and a
//! concurrency-control layer (rate limiting, spike arrest, adaptive
//! concurrency, load shedding).
//!
//! ## Dataflow
//!
//! ```text
//! ┌─────────────┐   ┌───────────────────────────┐   ┌──────────────────┐
//! │   Client    │──▶│   Portico Gateway         │──▶│   Upstream       │
//! │             │   │                           │   │   Services       │
//! └─────────────┘   │  ┌───────────────────────┐│   └──────────────────┘
//!                   │  │ Route Matcher (2-tier)││
//!                   │  ├───────────────────────┤│
//!                   │  │ Stage Pipeline        ││
//!                   │  │  admission → auth →   ││
//!                   │  │  cache → transforms   ││
//!                   │  ├───────────────────────┤│
//!                   │  │ Dispatcher            ││
//!                   │  │  LB · retry · hedge · ││
//!                   │  │  breaker · outlier    ││
//!                   │  └───────────────────────┘│
//!                   └───────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Loading, validation, secrets and snapshot publication
//! - [`models`] - Data models, policies and the error taxonomy
//! - [`pipeline`] - Stage kinds, canonical ordering and execution
//! - [`services`] - Dispatcher, cache, limiters, breakers, auth, KV
//! - [`routes`] - Actix endpoint wiring (health probes, proxy ingress)
//! - [`utils`] - Route matcher, net and path helpers
//! - [`logs`] - Logger configuration
//!
//! ## Quick Start
//!
//! ```no_run
//! use portico_rs::config::settings::load_settings;
//! use portico_rs::services::http::Gateway;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = load_settings()?;
//! let gateway = Gateway::new(settings)?;
//! // Mount with routes::http::configure_proxy on an actix HttpServer.
//! # Ok(())
//! # }
//! ```
//!
//! ## Environment Variables
//!
//! - `PORTICO_CONFIG_PATH`: Configuration file path (default: `./config.json`)
//! - `PORTICO_HOST`: Server bind address (default: `0.0.0.0`)
//! - `PORTICO_PORT`: Server port (default: `5900`)
//! - `RUST_LOG`: Log filter (default: `info`)
//! - `NO_COLOR`: Disable colored log output

pub mod config;
pub mod logs;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
pub mod utils;
