//! Route inventory and teardown
//!
//! Read-only enumeration of the managed server's routes grouped by domain,
//! plus the two operator actions on a domain: unmap (delete every route for
//! it) and kill (terminate the process on one of its ports, then unmap).
//! Nothing here ever creates a route.

use crate::admin::ConfigStore;
use crate::error::{AdminError, TeardownError};
use crate::model::{decode_routes, route_path, routes_path, DeletionOrder, Route};
use crate::process::ProcessControl;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// One host of one route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub domain: String,
    pub index: usize,
    /// `None` when the upstream dial has no parseable port
    pub port: Option<u16>,
}

/// Every route binding sharing a domain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainEntry {
    pub domain: String,
    pub indices: BTreeSet<usize>,
    pub ports: BTreeSet<u16>,
    /// Some binding for this domain had no parseable port
    pub has_unknown_port: bool,
}

impl DomainEntry {
    /// Port whose process a kill should target.
    ///
    /// With a single port it is chosen directly; with several the caller
    /// must name one. `Ok(None)` means the domain has no known port.
    pub fn kill_port(&self, requested: Option<u16>) -> Result<Option<u16>, TeardownError> {
        match requested {
            Some(port) if self.ports.contains(&port) => Ok(Some(port)),
            Some(port) => Err(TeardownError::PortNotMapped {
                domain: self.domain.clone(),
                port,
            }),
            None if self.ports.len() > 1 => Err(TeardownError::AmbiguousPort {
                domain: self.domain.clone(),
                ports: self.ports.iter().copied().collect(),
            }),
            None => Ok(self.ports.iter().next().copied()),
        }
    }

    /// Indices in the order they must be deleted
    pub fn deletion_order(&self) -> DeletionOrder {
        DeletionOrder::new(self.indices.iter().copied())
    }
}

/// Routes of one server grouped by lowercased domain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    entries: BTreeMap<String, DomainEntry>,
}

impl Inventory {
    pub fn from_routes(routes: &[Option<Route>]) -> Self {
        let mut inventory = Self::default();
        for binding in bindings(routes) {
            let domain = binding.domain.to_ascii_lowercase();
            let entry = inventory
                .entries
                .entry(domain.clone())
                .or_insert_with(|| DomainEntry {
                    domain,
                    ..DomainEntry::default()
                });
            entry.indices.insert(binding.index);
            match binding.port {
                Some(port) => {
                    entry.ports.insert(port);
                }
                None => entry.has_unknown_port = true,
            }
        }
        inventory
    }

    /// Entry for `domain`, compared case-insensitively
    pub fn get(&self, domain: &str) -> Option<&DomainEntry> {
        self.entries.get(&domain.to_ascii_lowercase())
    }

    pub fn entries(&self) -> impl Iterator<Item = &DomainEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Flatten routes into one binding per (route, host)
pub fn bindings(routes: &[Option<Route>]) -> Vec<RouteBinding> {
    routes
        .iter()
        .enumerate()
        .filter_map(|(index, route)| route.as_ref().map(|r| (index, r)))
        .flat_map(|(index, route)| {
            let port = route.upstream_port();
            route.hosts().map(move |host| RouteBinding {
                domain: host.to_string(),
                index,
                port,
            })
        })
        .collect()
}

/// Fetch the current route list of `server_id` and group it
pub async fn load_inventory<S: ConfigStore>(
    store: &S,
    server_id: &str,
) -> Result<Inventory, AdminError> {
    let routes = decode_routes(store.read(&routes_path(server_id)).await?);
    Ok(Inventory::from_routes(&routes))
}

/// Delete every route of `entry`, highest index first
pub async fn unmap<S: ConfigStore>(
    store: &S,
    server_id: &str,
    entry: &DomainEntry,
) -> Result<usize, AdminError> {
    let order = entry.deletion_order();
    for index in order.iter() {
        info!(domain = %entry.domain, index, "Deleting route");
        store.delete(&route_path(server_id, index)).await?;
    }
    Ok(order.len())
}

/// Terminate every process listening on `port`. Returns how many were
/// signalled; zero listeners is not an error.
pub async fn terminate_port<P: ProcessControl>(
    processes: &P,
    port: u16,
) -> Result<usize, TeardownError> {
    let pids = processes.listening_pids(port).await?;
    if pids.is_empty() {
        info!(port, "No process is listening on port");
        return Ok(0);
    }

    for pid in &pids {
        processes.terminate(*pid)?;
    }
    info!(port, count = pids.len(), "Terminated listening processes");
    Ok(pids.len())
}

/// Operator action on a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownAction {
    /// Delete the domain's routes
    Unmap,
    /// Terminate the process on a port, then delete the domain's routes
    Kill { port: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub domain: String,
    pub killed_port: Option<u16>,
    pub terminated: usize,
    pub deleted: usize,
}

/// Run `action` against `domain` on a freshly read route list.
///
/// Processes are signalled before any route is deleted; a signalling
/// failure aborts with the routes intact.
pub async fn teardown<S, P>(
    store: &S,
    processes: &P,
    server_id: &str,
    domain: &str,
    action: TeardownAction,
) -> Result<TeardownReport, TeardownError>
where
    S: ConfigStore,
    P: ProcessControl,
{
    let inventory = load_inventory(store, server_id).await?;
    let entry = inventory
        .get(domain)
        .ok_or_else(|| TeardownError::UnknownDomain(domain.to_string()))?;

    let mut report = TeardownReport {
        domain: entry.domain.clone(),
        killed_port: None,
        terminated: 0,
        deleted: 0,
    };

    if let TeardownAction::Kill { port } = action {
        match entry.kill_port(port)? {
            Some(port) => {
                report.terminated = terminate_port(processes, port).await?;
                report.killed_port = Some(port);
            }
            None => warn!(domain, "Domain has no known port, nothing to kill"),
        }
    }

    report.deleted = unmap(store, server_id, entry).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::memory::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    fn route(hosts: &[&str], dial: &str) -> Value {
        json!({
            "match": [{"host": hosts}],
            "handle": [{"handler": "reverse_proxy", "upstreams": [{"dial": dial}]}],
            "terminal": true
        })
    }

    fn store_with(routes: Vec<Value>) -> MemoryStore {
        MemoryStore::with_config(json!({
            "apps": {"http": {"servers": {"dev": {"routes": routes}}}}
        }))
    }

    fn hosts_of(store: &MemoryStore) -> Vec<Value> {
        store
            .read_sync("apps/http/servers/dev/routes")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["match"][0]["host"][0].clone())
            .collect()
    }

    #[derive(Default)]
    struct FakeProcesses {
        listeners: HashMap<u16, Vec<u32>>,
        failing: Option<u32>,
        signalled: Mutex<Vec<u32>>,
    }

    impl ProcessControl for FakeProcesses {
        async fn listening_pids(&self, port: u16) -> Result<Vec<u32>, ProcessError> {
            Ok(self.listeners.get(&port).cloned().unwrap_or_default())
        }

        fn terminate(&self, pid: u32) -> Result<(), ProcessError> {
            if self.failing == Some(pid) {
                return Err(ProcessError::Signal {
                    pid,
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            self.signalled.lock().push(pid);
            Ok(())
        }
    }

    #[test]
    fn test_groups_ports_by_domain() {
        let routes = decode_routes(Some(json!([
            route(&["api.local"], "localhost:3000"),
            route(&["web.local"], "localhost:5173"),
            route(&["api.local"], "localhost:{upstream}"),
        ])));

        let inventory = Inventory::from_routes(&routes);

        assert_eq!(inventory.len(), 2);
        let api = inventory.get("api.local").unwrap();
        assert_eq!(api.ports, BTreeSet::from([3000]));
        assert_eq!(api.indices, BTreeSet::from([0, 2]));
        assert!(api.has_unknown_port);
        assert!(!inventory.get("web.local").unwrap().has_unknown_port);
    }

    #[test]
    fn test_domains_are_grouped_case_insensitively() {
        let routes = decode_routes(Some(json!([
            route(&["API.local"], "localhost:3000"),
            route(&["api.local"], "localhost:3000"),
            route(&["Api.Local"], "localhost:3001"),
        ])));

        let inventory = Inventory::from_routes(&routes);

        assert_eq!(inventory.len(), 1);
        let entry = inventory.get("API.LOCAL").unwrap();
        assert_eq!(entry.domain, "api.local");
        assert_eq!(entry.indices, BTreeSet::from([0, 1, 2]));
        assert_eq!(entry.ports, BTreeSet::from([3000, 3001]));
    }

    #[tokio::test]
    async fn test_unmap_removes_every_case_of_domain() {
        let store = store_with(vec![
            route(&["API.local"], "localhost:3000"),
            route(&["web.local"], "localhost:5173"),
            route(&["api.local"], "localhost:3000"),
        ]);

        let report = teardown(&store, &FakeProcesses::default(), "dev", "api.local", TeardownAction::Unmap)
            .await
            .unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(hosts_of(&store), vec![json!("web.local")]);
    }

    #[test]
    fn test_every_host_of_a_route_is_listed() {
        let routes = decode_routes(Some(json!([
            route(&["a.local", "b.local"], "localhost:3000"),
        ])));

        let all = bindings(&routes);
        assert_eq!(
            all,
            vec![
                RouteBinding { domain: "a.local".to_string(), index: 0, port: Some(3000) },
                RouteBinding { domain: "b.local".to_string(), index: 0, port: Some(3000) },
            ]
        );
        assert_eq!(Inventory::from_routes(&routes).len(), 2);
    }

    #[test]
    fn test_kill_port_selection() {
        let single = DomainEntry {
            domain: "a.local".to_string(),
            ports: BTreeSet::from([3000]),
            ..DomainEntry::default()
        };
        assert_eq!(single.kill_port(None).unwrap(), Some(3000));
        assert_eq!(single.kill_port(Some(3000)).unwrap(), Some(3000));
        assert!(matches!(
            single.kill_port(Some(4000)),
            Err(TeardownError::PortNotMapped { port: 4000, .. })
        ));

        let several = DomainEntry {
            domain: "a.local".to_string(),
            ports: BTreeSet::from([3000, 3001]),
            ..DomainEntry::default()
        };
        assert!(matches!(
            several.kill_port(None),
            Err(TeardownError::AmbiguousPort { ref ports, .. }) if ports == &vec![3000, 3001]
        ));
        assert_eq!(several.kill_port(Some(3001)).unwrap(), Some(3001));

        assert_eq!(DomainEntry::default().kill_port(None).unwrap(), None);
    }

    #[tokio::test]
    async fn test_unmap_deletes_in_descending_order() {
        let store = store_with(vec![
            route(&["k0.local"], ":1"),
            route(&["k1.local"], ":1"),
            route(&["gone.local"], ":2"),
            route(&["k3.local"], ":1"),
            route(&["k4.local"], ":1"),
            route(&["gone.local"], ":2"),
            route(&["k6.local"], ":1"),
            route(&["gone.local"], ":2"),
        ]);
        let inventory = load_inventory(&store, "dev").await.unwrap();
        let entry = inventory.get("gone.local").unwrap();
        assert_eq!(entry.indices, BTreeSet::from([2, 5, 7]));

        let deleted = unmap(&store, "dev", entry).await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(
            store.deleted_paths(),
            vec![
                "apps/http/servers/dev/routes/7",
                "apps/http/servers/dev/routes/5",
                "apps/http/servers/dev/routes/2",
            ]
        );
        assert_eq!(
            hosts_of(&store),
            vec![json!("k0.local"), json!("k1.local"), json!("k3.local"), json!("k4.local"), json!("k6.local")]
        );
    }

    #[tokio::test]
    async fn test_ascending_deletion_would_hit_wrong_routes() {
        let store = store_with(vec![
            route(&["k0.local"], ":1"),
            route(&["k1.local"], ":1"),
            route(&["gone.local"], ":2"),
            route(&["k3.local"], ":1"),
            route(&["k4.local"], ":1"),
            route(&["gone.local"], ":2"),
            route(&["k6.local"], ":1"),
            route(&["gone.local"], ":2"),
        ]);

        // Ascending: the second delete already hits a bystander and the
        // third index no longer exists.
        for index in [2, 5] {
            store.delete_sync(&format!("apps/http/servers/dev/routes/{}", index)).unwrap();
        }
        assert!(store.delete_sync("apps/http/servers/dev/routes/7").is_err());
        assert!(!hosts_of(&store).contains(&json!("k6.local")));
        assert_eq!(
            hosts_of(&store).iter().filter(|h| *h == "gone.local").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_kill_then_unmap() {
        let store = store_with(vec![
            route(&["api.local"], "localhost:3000"),
            route(&["other.local"], "localhost:4000"),
            route(&["api.local"], "localhost:{upstream}"),
        ]);
        let processes = FakeProcesses {
            listeners: HashMap::from([(3000, vec![11, 12])]),
            ..FakeProcesses::default()
        };

        let report = teardown(&store, &processes, "dev", "api.local", TeardownAction::Kill { port: None })
            .await
            .unwrap();

        assert_eq!(report.killed_port, Some(3000));
        assert_eq!(report.terminated, 2);
        assert_eq!(report.deleted, 2);
        assert_eq!(*processes.signalled.lock(), vec![11, 12]);
        assert_eq!(hosts_of(&store), vec![json!("other.local")]);
    }

    #[tokio::test]
    async fn test_kill_with_no_listener_still_unmaps() {
        let store = store_with(vec![route(&["api.local"], "localhost:3000")]);
        let processes = FakeProcesses::default();

        let report = teardown(&store, &processes, "dev", "api.local", TeardownAction::Kill { port: None })
            .await
            .unwrap();

        assert_eq!(report.terminated, 0);
        assert_eq!(report.deleted, 1);
    }

    #[tokio::test]
    async fn test_signal_failure_leaves_routes_in_place() {
        let store = store_with(vec![route(&["api.local"], "localhost:3000")]);
        let processes = FakeProcesses {
            listeners: HashMap::from([(3000, vec![11, 12])]),
            failing: Some(12),
            ..FakeProcesses::default()
        };

        let err = teardown(&store, &processes, "dev", "api.local", TeardownAction::Kill { port: None })
            .await
            .unwrap_err();

        assert!(matches!(err, TeardownError::Process(ProcessError::Signal { pid: 12, .. })));
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_kill_does_not_delete() {
        let store = store_with(vec![
            route(&["api.local"], "localhost:3000"),
            route(&["api.local"], "localhost:3001"),
        ]);

        let err = teardown(
            &store,
            &FakeProcesses::default(),
            "dev",
            "api.local",
            TeardownAction::Kill { port: None },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TeardownError::AmbiguousPort { .. }));
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_unmap_removes_all_ports_of_domain() {
        let store = store_with(vec![
            route(&["api.local"], "localhost:3000"),
            route(&["api.local"], "localhost:3001"),
        ]);

        let report = teardown(&store, &FakeProcesses::default(), "dev", "api.local", TeardownAction::Unmap)
            .await
            .unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(report.killed_port, None);
        assert!(hosts_of(&store).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let store = store_with(vec![]);
        let err = teardown(&store, &FakeProcesses::default(), "dev", "nope.local", TeardownAction::Unmap)
            .await
            .unwrap_err();
        assert!(matches!(err, TeardownError::UnknownDomain(_)));
    }

    #[tokio::test]
    async fn test_missing_server_is_an_empty_inventory() {
        let store = MemoryStore::with_config(json!({"apps": {}}));
        assert!(load_inventory(&store, "dev").await.unwrap().is_empty());
    }
}
