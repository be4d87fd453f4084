//! Error types for the admin API client, the startup wiring flow and teardown

use thiserror::Error;

/// Failure talking to the proxy's admin API.
///
/// A missing path is not an error: [`crate::admin::ConfigStore::read`]
/// reports it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The admin endpoint could not be reached
    #[error("admin API unreachable: {0}")]
    Network(#[from] reqwest::Error),

    /// The admin endpoint answered with a non-success status
    #[error("{method} {path} failed with status {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    /// A response body was not the JSON we expected
    #[error("invalid JSON at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The configured admin URL is unusable
    #[error("invalid admin URL: {0}")]
    InvalidUrl(String),
}

impl AdminError {
    /// HTTP status of a rejected request, if the endpoint answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            AdminError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failure wiring a domain to the local server at startup
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Admin(#[from] AdminError),

    /// Another live process owns the domain
    #[error("{domain} is served by a live process on port {existing_port}, refusing to rebind it to {desired_port}")]
    Conflict {
        domain: String,
        existing_port: u16,
        desired_port: u16,
    },
}

/// Failure resolving or signalling OS processes
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to list processes listening on port {port}: {reason}")]
    Lookup { port: u16, reason: String },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Failure inspecting or tearing down routes
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("no route matches {0}")]
    UnknownDomain(String),

    /// The domain maps to several ports and none was chosen
    #[error("{domain} maps to several ports ({}); pick one with --port", join_ports(.ports))]
    AmbiguousPort { domain: String, ports: Vec<u16> },

    #[error("{domain} has no route dialing port {port}")]
    PortNotMapped { domain: String, port: u16 },
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
