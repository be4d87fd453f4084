//! Devroute - keeps a local reverse proxy's routes pointed at a dev server
//!
//! This library drives the proxy's admin API to:
//! - Bootstrap a server entry and an internal-CA TLS policy for a domain
//! - Point a domain's route at the port the local server just bound,
//!   reclaiming routes whose previous owner has stopped listening
//! - Refuse to rebind a domain that another live process still serves
//! - List managed routes by domain and tear them down, optionally killing
//!   the process bound to the route's port first

pub mod admin;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod inventory;
pub mod memory;
pub mod model;
pub mod probe;
pub mod process;
pub mod reconcile;
pub mod startup;
