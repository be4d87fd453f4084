//! Route reconciliation for one `(domain, port)` pair
//!
//! Ports change every time the local server restarts, so the route for a
//! fixed domain has to follow them. A route is only rebound once the process
//! it points at has stopped accepting connections; a live foreign owner is
//! reported as a conflict and left alone.

use crate::admin::ConfigStore;
use crate::config::{Config, RoutePosition};
use crate::error::AdminError;
use crate::model::{decode_routes, route_path, routes_path, DeletionOrder, Route};
use crate::probe::LivenessProbe;
use tracing::{debug, info, warn};

/// Where and how routes are written
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub server_id: String,
    pub upstream_host: String,
    pub position: RoutePosition,
}

impl From<&Config> for ReconcileOptions {
    fn from(config: &Config) -> Self {
        Self {
            server_id: config.server_id.clone(),
            upstream_host: config.upstream_host.clone(),
            position: config.route_position,
        }
    }
}

/// Observed state of the route for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    NoRoute,
    /// A route matches but its upstream has no parseable port
    NoPort { index: usize },
    SamePort { index: usize },
    DifferentPortActive { index: usize, existing_port: u16 },
    DifferentPortInactive { index: usize, existing_port: u16 },
}

/// What reconciliation did to the route list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created { index: usize },
    Replaced { index: usize, previous_port: Option<u16> },
    Unchanged { index: usize },
    /// Another live process owns the domain; nothing was written
    Conflict { index: usize, existing_port: u16 },
}

impl ReconcileOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub outcome: ReconcileOutcome,
    /// Duplicate routes for the domain removed or narrowed afterwards
    pub pruned: usize,
}

/// Classify the first route matching `domain`.
///
/// The existing upstream is probed on its own host when the dial names one.
pub async fn observe<P: LivenessProbe>(
    routes: &[Option<Route>],
    domain: &str,
    desired_port: u16,
    probe: &P,
    fallback_host: &str,
) -> RouteState {
    let Some((index, route)) = first_match(routes, domain) else {
        return RouteState::NoRoute;
    };

    let Some(existing_port) = route.upstream_port() else {
        return RouteState::NoPort { index };
    };

    if existing_port == desired_port {
        return RouteState::SamePort { index };
    }

    let host = route.upstream_host().unwrap_or(fallback_host);
    if probe.is_active(host, existing_port).await {
        RouteState::DifferentPortActive {
            index,
            existing_port,
        }
    } else {
        RouteState::DifferentPortInactive {
            index,
            existing_port,
        }
    }
}

fn first_match<'a>(routes: &'a [Option<Route>], domain: &str) -> Option<(usize, &'a Route)> {
    routes
        .iter()
        .enumerate()
        .find_map(|(i, r)| r.as_ref().filter(|r| r.matches_host(domain)).map(|r| (i, r)))
}

/// Bring the route for `domain` in line with `desired_port`
pub async fn reconcile<S, P>(
    store: &S,
    probe: &P,
    options: &ReconcileOptions,
    domain: &str,
    desired_port: u16,
) -> Result<Reconciliation, AdminError>
where
    S: ConfigStore,
    P: LivenessProbe,
{
    let list_path = routes_path(&options.server_id);
    let routes = decode_routes(store.read(&list_path).await?);
    let state = observe(&routes, domain, desired_port, probe, &options.upstream_host).await;
    debug!(domain, desired_port, ?state, "Observed route state");

    let desired = Route::reverse_proxy(domain, &options.upstream_host, desired_port).to_value();

    let outcome = match state {
        RouteState::NoRoute => {
            let index = match options.position {
                RoutePosition::Append => {
                    store.append(&list_path, &desired).await?;
                    routes.len()
                }
                RoutePosition::Prepend => {
                    store.create(&route_path(&options.server_id, 0), &desired).await?;
                    0
                }
            };
            info!(domain, port = desired_port, index, "Route created");
            ReconcileOutcome::Created { index }
        }
        RouteState::NoPort { index } => {
            rebind(store, options, &routes, index, domain, &desired).await?;
            info!(domain, port = desired_port, index, "Replaced route with unparseable upstream");
            ReconcileOutcome::Replaced {
                index,
                previous_port: None,
            }
        }
        RouteState::SamePort { index } => {
            debug!(domain, port = desired_port, index, "Route already up to date");
            ReconcileOutcome::Unchanged { index }
        }
        RouteState::DifferentPortInactive {
            index,
            existing_port,
        } => {
            rebind(store, options, &routes, index, domain, &desired).await?;
            info!(
                domain,
                previous_port = existing_port,
                port = desired_port,
                index,
                "Reclaimed stale route"
            );
            ReconcileOutcome::Replaced {
                index,
                previous_port: Some(existing_port),
            }
        }
        RouteState::DifferentPortActive {
            index,
            existing_port,
        } => {
            return Ok(Reconciliation {
                outcome: ReconcileOutcome::Conflict {
                    index,
                    existing_port,
                },
                pruned: 0,
            });
        }
    };

    let pruned = prune_duplicates(store, options, domain, desired_port).await?;
    Ok(Reconciliation { outcome, pruned })
}

/// Point the route at `index` to `desired`. A route shared with other hosts
/// keeps serving them: it loses `domain`, and `desired` is inserted in front
/// of it so the domain keeps its priority.
async fn rebind<S: ConfigStore>(
    store: &S,
    options: &ReconcileOptions,
    routes: &[Option<Route>],
    index: usize,
    domain: &str,
    desired: &serde_json::Value,
) -> Result<(), AdminError> {
    let path = route_path(&options.server_id, index);
    match routes.get(index).and_then(Option::as_ref) {
        Some(shared) if !shared.matches_only(domain) => {
            info!(domain, index, "Splitting domain out of shared route");
            store.replace(&path, &shared.without_host(domain).to_value()).await?;
            store.create(&path, desired).await
        }
        _ => store.replace(&path, desired).await,
    }
}

/// Remove every route for `domain` except the first one dialing
/// `desired_port`. Routes shared with other hosts only lose this domain.
async fn prune_duplicates<S: ConfigStore>(
    store: &S,
    options: &ReconcileOptions,
    domain: &str,
    desired_port: u16,
) -> Result<usize, AdminError> {
    let routes = decode_routes(store.read(&routes_path(&options.server_id)).await?);

    let keep = routes.iter().position(|r| {
        r.as_ref()
            .is_some_and(|r| r.matches_host(domain) && r.upstream_port() == Some(desired_port))
    });

    let extras: Vec<(usize, &Route)> = routes
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != keep)
        .filter_map(|(i, r)| r.as_ref().filter(|r| r.matches_host(domain)).map(|r| (i, r)))
        .collect();

    if extras.is_empty() {
        return Ok(0);
    }

    let narrowed: Vec<(usize, Route)> = extras
        .iter()
        .filter(|(_, r)| !r.matches_only(domain))
        .map(|(i, r)| (*i, r.without_host(domain)))
        .collect();
    for (index, route) in &narrowed {
        warn!(domain, index, "Removing domain from shared duplicate route");
        store
            .replace(&route_path(&options.server_id, *index), &route.to_value())
            .await?;
    }

    let deletions = DeletionOrder::new(
        extras
            .iter()
            .filter(|(_, r)| r.matches_only(domain))
            .map(|(i, _)| *i),
    );
    for index in deletions.iter() {
        warn!(domain, index, "Deleting duplicate route");
        store.delete(&route_path(&options.server_id, index)).await?;
    }

    Ok(narrowed.len() + deletions.len())
}
