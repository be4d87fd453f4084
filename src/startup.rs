//! Entry point for the "local server is now listening" event
//!
//! Bootstraps the proxy and reconciles the domain's route. Failures here
//! must never take the local server down with them: [`on_listening`] logs
//! and swallows every error.

use crate::admin::{AdminClient, ConfigStore};
use crate::bootstrap::{bootstrap, BootstrapReport};
use crate::config::{Config, ConflictPolicy};
use crate::error::WireError;
use crate::probe::{LivenessProbe, TcpProbe};
use crate::reconcile::{reconcile, ReconcileOptions, ReconcileOutcome, Reconciliation};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireReport {
    pub domain: String,
    pub port: u16,
    pub bootstrap: BootstrapReport,
    pub reconciliation: Reconciliation,
}

impl WireReport {
    /// Whether the domain now routes to the local server
    pub fn is_wired(&self) -> bool {
        !self.reconciliation.outcome.is_conflict()
    }
}

/// Bootstrap the proxy and point `domain` at `port`.
///
/// A live foreign owner is an error under [`ConflictPolicy::Strict`] and a
/// warning under [`ConflictPolicy::Lenient`]; neither touches the route.
pub async fn wire<S, P>(
    store: &S,
    probe: &P,
    config: &Config,
    domain: &str,
    port: u16,
) -> Result<WireReport, WireError>
where
    S: ConfigStore,
    P: LivenessProbe,
{
    let bootstrap = bootstrap(store, &config.server_id, &config.listen, domain).await?;
    let options = ReconcileOptions::from(config);
    let reconciliation = reconcile(store, probe, &options, domain, port).await?;

    if let ReconcileOutcome::Conflict { existing_port, .. } = reconciliation.outcome {
        match config.conflict_policy {
            ConflictPolicy::Strict => {
                return Err(WireError::Conflict {
                    domain: domain.to_string(),
                    existing_port,
                    desired_port: port,
                });
            }
            ConflictPolicy::Lenient => {
                warn!(
                    domain,
                    existing_port,
                    port,
                    "Domain is held by another live process, leaving its route alone"
                );
            }
        }
    }

    Ok(WireReport {
        domain: domain.to_string(),
        port,
        bootstrap,
        reconciliation,
    })
}

/// [`wire`] with errors logged instead of returned
pub async fn on_listening_with<S, P>(
    store: &S,
    probe: &P,
    config: &Config,
    domain: &str,
    port: u16,
) -> Option<WireReport>
where
    S: ConfigStore,
    P: LivenessProbe,
{
    match wire(store, probe, config, domain, port).await {
        Ok(report) => {
            if report.is_wired() {
                info!(domain, port, "https://{} -> {}:{}", domain, config.upstream_host, port);
            }
            Some(report)
        }
        Err(WireError::Conflict {
            domain,
            existing_port,
            desired_port,
        }) => {
            error!(
                domain,
                existing_port,
                port = desired_port,
                "Domain is held by another live process; continuing without a route"
            );
            None
        }
        Err(e) => {
            error!(domain, port, error = %e, "Failed to wire domain into the proxy");
            None
        }
    }
}

/// Handle the local server's listening event using the admin API and a TCP
/// probe built from `config`
pub async fn on_listening(config: &Config, domain: &str, port: u16) -> Option<WireReport> {
    let client = match AdminClient::new(&config.admin_url) {
        Ok(client) => client,
        Err(e) => {
            error!(admin_url = %config.admin_url, error = %e, "Cannot create admin API client");
            return None;
        }
    };
    let probe = TcpProbe::new(config.probe_timeout());
    on_listening_with(&client, &probe, config, domain, port).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::probe::FixedProbe;
    use serde_json::json;

    fn owned_by(port: u16) -> MemoryStore {
        MemoryStore::with_config(json!({
            "apps": {
                "http": {"servers": {"devroute": {"listen": [":443", ":80"], "routes": [{
                    "match": [{"host": ["example.local"]}],
                    "handle": [{"handler": "reverse_proxy", "upstreams": [{"dial": format!("127.0.0.1:{}", port)}]}],
                    "terminal": true
                }]}}},
                "tls": {"automation": {"policies": [
                    {"subjects": ["example.local"], "issuers": [{"module": "internal"}]}
                ]}}
            }
        }))
    }

    #[tokio::test]
    async fn test_wire_seeds_and_creates_route() {
        let store = MemoryStore::new();
        let config = Config::default();

        let report = wire(&store, &FixedProbe::live(&[]), &config, "example.local", 4001)
            .await
            .unwrap();

        assert!(report.bootstrap.seeded);
        assert!(report.is_wired());
        assert_eq!(report.reconciliation.outcome, ReconcileOutcome::Created { index: 0 });
        assert_eq!(
            store.snapshot()["apps"]["http"]["servers"]["devroute"]["routes"][0]["handle"][0]["upstreams"][0]["dial"],
            "127.0.0.1:4001"
        );
    }

    #[tokio::test]
    async fn test_wire_onto_server_without_route_list() {
        let store = MemoryStore::with_config(json!({
            "apps": {"http": {"servers": {"devroute": {"listen": [":443", ":80"]}}}}
        }));

        let report = wire(&store, &FixedProbe::live(&[]), &Config::default(), "example.local", 4001)
            .await
            .unwrap();

        assert!(report.bootstrap.routes_created);
        assert_eq!(report.reconciliation.outcome, ReconcileOutcome::Created { index: 0 });
        let routes = &store.snapshot()["apps"]["http"]["servers"]["devroute"]["routes"];
        assert_eq!(routes.as_array().unwrap().len(), 1);
        assert_eq!(routes[0]["match"], json!([{"host": ["example.local"]}]));
        assert_eq!(routes[0]["handle"][0]["upstreams"][0]["dial"], "127.0.0.1:4001");
    }

    #[tokio::test]
    async fn test_strict_conflict_is_an_error_and_leaves_route() {
        let store = owned_by(4001);
        let before = store.snapshot();

        let err = wire(&store, &FixedProbe::live(&[4001]), &Config::default(), "example.local", 4002)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WireError::Conflict { existing_port: 4001, desired_port: 4002, .. }
        ));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_lenient_conflict_only_warns() {
        let store = owned_by(4001);
        let before = store.snapshot();
        let config = Config {
            conflict_policy: ConflictPolicy::Lenient,
            ..Config::default()
        };

        let report = wire(&store, &FixedProbe::live(&[4001]), &config, "example.local", 4002)
            .await
            .unwrap();

        assert!(!report.is_wired());
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_on_listening_swallows_conflict() {
        let store = owned_by(4001);
        let report =
            on_listening_with(&store, &FixedProbe::live(&[4001]), &Config::default(), "example.local", 4002)
                .await;
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn test_on_listening_swallows_transport_errors() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config {
            admin_url: format!("http://127.0.0.1:{}", port),
            ..Config::default()
        };

        assert!(on_listening(&config, "example.local", 4002).await.is_none());
    }

    #[tokio::test]
    async fn test_on_listening_reclaims_stale_route() {
        let store = owned_by(4001);

        let report = on_listening_with(&store, &FixedProbe::live(&[]), &Config::default(), "example.local", 4002)
            .await
            .unwrap();

        assert_eq!(
            report.reconciliation.outcome,
            ReconcileOutcome::Replaced { index: 0, previous_port: Some(4001) }
        );
        assert!(!report.bootstrap.changed());
    }
}
