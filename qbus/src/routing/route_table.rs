// Route table
//
// Reachability facts: which neighbour connection leads to which module.
// Direct neighbours always route over their own connection; everything they
// advertise is reachable one hop behind them. When several neighbours
// advertise the same module the most recent advertisement wins.

use std::collections::{HashMap, HashSet};

use qbus_common::Value;

#[derive(Default)]
pub(crate) struct RouteTable {
    /// Learned neighbour name -> connection handle.
    direct: HashMap<String, u64>,
    /// Neighbour name -> set of modules it advertised last.
    advertised: HashMap<String, HashSet<String>>,
    /// Derived lookup: module name -> connection handle of the next hop.
    routes: HashMap<String, u64>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer` at the far end of connection `conn` as reachable, plus
    /// every module in its advertised set. The local name and the peer's own
    /// name are skipped when merging the set.
    pub fn add(&mut self, local: &str, peer: &str, conn: u64, advertised: Option<&Value>) {
        self.direct.insert(peer.to_string(), conn);

        let set = collect_names(advertised, local, peer);
        self.advertised.insert(peer.to_string(), set.clone());
        // a re-handshake replaces whatever the peer advertised before
        self.rebuild();
        for name in &set {
            if !self.direct.contains_key(name) {
                self.routes.insert(name.clone(), conn);
            }
        }
    }

    /// Replace the advertised set of a known neighbour and recompute
    /// reachability. Modules no longer advertised by anyone disappear.
    pub fn update(&mut self, local: &str, peer: &str, advertised: &Value) {
        let Some(conn) = self.direct.get(peer).copied() else {
            return;
        };
        let set = collect_names(Some(advertised), local, peer);
        self.advertised.insert(peer.to_string(), set.clone());
        self.rebuild();
        // the fresh advertisement is the preferred route for its modules
        for name in &set {
            if !self.direct.contains_key(name) {
                self.routes.insert(name.clone(), conn);
            }
        }
    }

    /// Forget a neighbour and everything reachable only through it.
    pub fn remove(&mut self, peer: &str) {
        self.direct.remove(peer);
        self.advertised.remove(peer);
        self.rebuild();
    }

    /// Connection handle of the preferred next hop towards `module`.
    pub fn get(&self, module: &str) -> Option<u64> {
        self.routes.get(module).copied()
    }

    /// All currently reachable module names plus the local one, sorted, as
    /// a payload list for ROUTE_RES / ROUTE_UPD frames and observers.
    pub fn nodes(&self, local: &str) -> Value {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.push(local);
        names.sort_unstable();
        names.dedup();
        Value::List(names.into_iter().map(Value::from).collect())
    }

    /// Handles of all neighbour connections except `exclude`, deduplicated.
    pub fn conns(&self, exclude: Option<u64>) -> Vec<u64> {
        let mut handles: Vec<u64> = self
            .direct
            .values()
            .copied()
            .filter(|handle| Some(*handle) != exclude)
            .collect();
        handles.sort_unstable();
        handles.dedup();
        handles
    }

    fn rebuild(&mut self) {
        self.routes.clear();
        for (peer, conn) in &self.direct {
            self.routes.insert(peer.clone(), *conn);
        }
        for (peer, set) in &self.advertised {
            if let Some(conn) = self.direct.get(peer) {
                for name in set {
                    if !self.direct.contains_key(name) {
                        self.routes.entry(name.clone()).or_insert(*conn);
                    }
                }
            }
        }
    }
}

fn collect_names(advertised: Option<&Value>, local: &str, peer: &str) -> HashSet<String> {
    let mut set = HashSet::new();
    if let Some(Value::List(items)) = advertised {
        for item in items {
            if let Some(name) = item.as_str() {
                if name != local && name != peer {
                    set.insert(name.to_string());
                }
            }
        }
    }
    set
}
