//! In-memory route table: the gateway's copy of the compiled blob.
//!
//! Loading compiles every intent regex up front; matching walks the
//! priority-sorted rules against an immutable snapshot, so a request sees
//! either the whole old table or the whole new one.

use agentmesh_operator::render::{CompiledBackend, RouteDefaultConfig, RouteTable as TableBlob};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to read routes file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse routes file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid intent regex in rule {rule:?}: {source}")]
    Regex {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// One rule with its regex compiled.
struct CompiledTableRule {
    name: String,
    agent: Option<String>,
    intent_regex: Option<Regex>,
    tenant_id: Option<String>,
    headers: Vec<(String, String)>,
    backends: Vec<CompiledBackend>,
}

/// An immutable compiled snapshot.
#[derive(Default)]
pub struct Snapshot {
    rules: Vec<CompiledTableRule>,
    defaults: Option<RouteDefaultConfig>,
    blob: TableBlob,
}

/// Request attributes relevant to matching.
#[derive(Debug, Default, Clone)]
pub struct MatchRequest {
    pub agent: String,
    pub intent: String,
    pub tenant_id: String,
    pub headers: HashMap<String, String>,
}

/// A matched rule with its ready backends.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub rule_name: String,
    pub backends: Vec<CompiledBackend>,
}

/// Shared route table, swapped atomically on reload.
pub struct RouteTable {
    inner: RwLock<Arc<Snapshot>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Load from the compiled blob on disk.
    pub fn load_from_file(&self, path: &Path) -> Result<(), TableError> {
        let data = std::fs::read(path)?;
        self.load_from_json(&data)
    }

    /// Parse and compile, then swap the snapshot. On error the previous
    /// table stays live.
    pub fn load_from_json(&self, data: &[u8]) -> Result<(), TableError> {
        let blob: TableBlob = serde_json::from_slice(data)?;

        let mut rules = Vec::with_capacity(blob.rules.len());
        for rule in &blob.rules {
            let intent_regex = match rule.match_.intent_regex.as_deref() {
                Some(pattern) => Some(Regex::new(pattern).map_err(|source| TableError::Regex {
                    rule: rule.name.clone(),
                    source,
                })?),
                None => None,
            };

            rules.push(CompiledTableRule {
                name: rule.name.clone(),
                agent: rule.match_.agent.clone(),
                intent_regex,
                tenant_id: rule.match_.tenant_id.clone(),
                headers: rule
                    .match_
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                backends: rule.backends.clone(),
            });
        }

        let snapshot = Arc::new(Snapshot {
            rules,
            defaults: blob.defaults.clone(),
            blob,
        });

        *self.inner.write() = snapshot;
        Ok(())
    }

    /// Copy the current snapshot pointer.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().clone()
    }

    /// Match a request against the current snapshot.
    pub fn match_request(&self, request: &MatchRequest) -> Option<MatchResult> {
        self.snapshot().match_request(request)
    }

    /// Current defaults, if the table declares any.
    pub fn defaults(&self) -> Option<RouteDefaultConfig> {
        self.snapshot().defaults.clone()
    }
}

impl Snapshot {
    /// First-match procedure: explicit agent rules first, then the
    /// priority-ordered scan, then the default backend.
    pub fn match_request(&self, request: &MatchRequest) -> Option<MatchResult> {
        // Explicit agent requests prefer a rule naming that agent
        if !request.agent.is_empty() {
            for rule in &self.rules {
                if rule.agent.as_deref() == Some(request.agent.as_str()) {
                    let ready = ready_backends(&rule.backends);
                    if !ready.is_empty() {
                        return Some(MatchResult {
                            rule_name: rule.name.clone(),
                            backends: ready,
                        });
                    }
                }
            }
        }

        // Rules are already priority-sorted by the compiler
        for rule in &self.rules {
            if rule.matches(request) {
                let ready = ready_backends(&rule.backends);
                if !ready.is_empty() {
                    return Some(MatchResult {
                        rule_name: rule.name.clone(),
                        backends: ready,
                    });
                }
            }
        }

        if let Some(backend) = self.defaults.as_ref().and_then(|d| d.backend.as_ref()) {
            if backend.ready {
                return Some(MatchResult {
                    rule_name: "_default".to_string(),
                    backends: vec![backend.clone()],
                });
            }
        }

        None
    }

    /// Route names, in table order.
    pub fn route_names(&self) -> Vec<String> {
        self.blob.rules.iter().map(|r| r.name.clone()).collect()
    }

    /// Unique "namespace/name" of every ready backend.
    pub fn ready_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .blob
            .rules
            .iter()
            .flat_map(|r| r.backends.iter())
            .filter(|b| b.ready)
            .map(|b| format!("{}/{}", b.namespace, b.agent_name))
            .collect();
        agents.sort();
        agents.dedup();
        agents
    }

    pub fn defaults(&self) -> Option<&RouteDefaultConfig> {
        self.defaults.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.defaults.is_none()
    }
}

impl CompiledTableRule {
    /// All non-empty criteria must hold.
    fn matches(&self, request: &MatchRequest) -> bool {
        if let Some(agent) = self.agent.as_deref() {
            if !agent.is_empty() && agent != request.agent {
                return false;
            }
        }

        if let Some(regex) = &self.intent_regex {
            if !regex.is_match(&request.intent) {
                return false;
            }
        }

        if let Some(tenant) = self.tenant_id.as_deref() {
            if !tenant.is_empty() && tenant != request.tenant_id {
                return false;
            }
        }

        for (key, value) in &self.headers {
            // HTTP/2 delivers header names lowercased
            let observed = request
                .headers
                .get(key)
                .or_else(|| request.headers.get(&key.to_ascii_lowercase()));
            if observed != Some(value) {
                return false;
            }
        }

        true
    }
}

fn ready_backends(backends: &[CompiledBackend]) -> Vec<CompiledBackend> {
    backends.iter().filter(|b| b.ready).cloned().collect()
}
