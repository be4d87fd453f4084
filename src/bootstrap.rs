//! Makes sure the proxy has our server entry and a TLS policy for a domain
//!
//! Every step is create-if-absent, so a run interrupted half way is finished
//! by the next one. Configuration we did not create is never removed.

use crate::admin::{ensure, ConfigStore};
use crate::error::AdminError;
use crate::model::{routes_path, server_path, ServerView, TlsPolicy, POLICIES_PATH, SERVERS_PATH};
use serde_json::{json, Value};
use tracing::{debug, info};

/// What a bootstrap run changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// The proxy had no configuration and was seeded in one request
    pub seeded: bool,
    pub server_created: bool,
    /// An existing server entry had no route list
    pub routes_created: bool,
    pub listen_updated: bool,
    pub https_reenabled: bool,
    pub policy_added: bool,
}

impl BootstrapReport {
    pub fn changed(&self) -> bool {
        self.seeded
            || self.server_created
            || self.routes_created
            || self.listen_updated
            || self.https_reenabled
            || self.policy_added
    }
}

/// Ensure server `server_id` listens on at least `listen` and that `domain`
/// has an internal-issuer TLS policy.
pub async fn bootstrap<S: ConfigStore>(
    store: &S,
    server_id: &str,
    listen: &[String],
    domain: &str,
) -> Result<BootstrapReport, AdminError> {
    let mut report = BootstrapReport::default();

    if store.read("").await?.is_none() {
        info!(server_id, domain, "Proxy has no configuration, seeding it");
        store.load(&seed_config(server_id, listen, domain)).await?;
        report.seeded = true;
        return Ok(report);
    }

    ensure_server(store, server_id, listen, &mut report).await?;
    ensure_tls_policy(store, domain, &mut report).await?;

    if report.changed() {
        info!(server_id, domain, ?report, "Proxy configuration bootstrapped");
    } else {
        debug!(server_id, domain, "Proxy configuration already in place");
    }

    Ok(report)
}

/// Full configuration for a proxy that has none
pub fn seed_config(server_id: &str, listen: &[String], domain: &str) -> Value {
    json!({
        "apps": {
            "http": {
                "servers": {
                    server_id: new_server(listen),
                }
            },
            "tls": {
                "automation": {
                    "policies": [TlsPolicy::internal(domain).to_value()],
                }
            }
        }
    })
}

fn new_server(listen: &[String]) -> Value {
    json!({ "listen": listen, "routes": [] })
}

/// Set union of listen addresses: existing order first, then new addresses
/// in the order desired. Nothing is ever removed.
pub fn merge_listen(current: &[String], desired: &[String]) -> Vec<String> {
    let mut merged = current.to_vec();
    for addr in desired {
        if !merged.contains(addr) {
            merged.push(addr.clone());
        }
    }
    merged
}

async fn ensure_server<S: ConfigStore>(
    store: &S,
    server_id: &str,
    listen: &[String],
    report: &mut BootstrapReport,
) -> Result<(), AdminError> {
    ensure(store, "apps", json!({})).await?;
    ensure(store, "apps/http", json!({})).await?;
    ensure(store, SERVERS_PATH, json!({})).await?;

    let path = server_path(server_id);
    let Some(existing) = store.read(&path).await? else {
        info!(server_id, ?listen, "Creating proxy server entry");
        store.create(&path, &new_server(listen)).await?;
        report.server_created = true;
        return Ok(());
    };

    let server: ServerView = serde_json::from_value(existing).map_err(|source| {
        AdminError::Decode {
            path: path.clone(),
            source,
        }
    })?;

    let listen_path = format!("{}/listen", path);
    match server.listen {
        None => {
            store.create(&listen_path, &json!(listen)).await?;
            report.listen_updated = true;
        }
        Some(current) => {
            let merged = merge_listen(&current, listen);
            if merged != current {
                info!(server_id, ?current, ?merged, "Adding listen addresses");
                store.replace(&listen_path, &json!(merged)).await?;
                report.listen_updated = true;
            }
        }
    }

    if server.routes.is_none() {
        info!(server_id, "Creating empty route list");
        store.create(&routes_path(server_id), &json!([])).await?;
        report.routes_created = true;
    }

    if server.automatic_https.is_some_and(|a| a.disable) {
        info!(server_id, "Re-enabling automatic HTTPS");
        store
            .delete(&format!("{}/automatic_https/disable", path))
            .await?;
        report.https_reenabled = true;
    }

    Ok(())
}

async fn ensure_tls_policy<S: ConfigStore>(
    store: &S,
    domain: &str,
    report: &mut BootstrapReport,
) -> Result<(), AdminError> {
    ensure(store, "apps/tls", json!({})).await?;
    ensure(store, "apps/tls/automation", json!({})).await?;
    let policies = ensure(store, POLICIES_PATH, json!([])).await?;

    let covered = policies
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|p| serde_json::from_value::<TlsPolicy>(p.clone()).ok())
                .any(|p| p.covers(domain))
        })
        .unwrap_or(false);

    if !covered {
        info!(domain, "Adding internal TLS policy");
        store
            .append(POLICIES_PATH, &TlsPolicy::internal(domain).to_value())
            .await?;
        report.policy_added = true;
    }

    Ok(())
}
