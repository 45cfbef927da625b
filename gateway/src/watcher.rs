//! Agent CRD cache for MCP discovery.
//!
//! A watcher stream keeps a concurrent map of agents current; whenever the
//! set of ready agents changes, subscribers are notified so streaming MCP
//! sessions can be told the tool list changed.

use agentmesh_operator::crds::Agent;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct AgentWatcher {
    agents: DashMap<String, Arc<Agent>>,
    ready_set: Mutex<BTreeSet<String>>,
    changed_tx: broadcast::Sender<()>,
}

impl Default for AgentWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentWatcher {
    pub fn new() -> Self {
        let (changed_tx, _) = broadcast::channel(16);
        Self {
            agents: DashMap::new(),
            ready_set: Mutex::new(BTreeSet::new()),
            changed_tx,
        }
    }

    /// Notified whenever the ready-agent set changes.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changed_tx.subscribe()
    }

    /// Run the watch loop until shutdown. Watches one namespace when
    /// given, the whole cluster otherwise.
    pub async fn run(self: Arc<Self>, client: Client, namespace: Option<String>) {
        let api: Api<Agent> = match namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Api::namespaced(client, ns),
            _ => Api::all(client),
        };

        info!(
            "Starting Agent watcher (namespace={})",
            namespace.as_deref().unwrap_or("<all>")
        );

        let mut stream = watcher(api, WatcherConfig::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(agent) | Event::InitApply(agent)) => {
                    let key = agent_key(&agent);
                    debug!(
                        "Agent updated: {key} (ready={})",
                        agent.status.as_ref().is_some_and(|s| s.ready)
                    );
                    self.agents.insert(key, Arc::new(agent));
                    self.refresh_ready_set();
                }
                Ok(Event::Delete(agent)) => {
                    let key = agent_key(&agent);
                    info!("Agent deleted: {key}");
                    self.agents.remove(&key);
                    self.refresh_ready_set();
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => {
                    warn!("Agent watch error: {e}");
                }
            }
        }

        info!("Agent watcher stopped");
    }

    /// All cached agents.
    pub fn list(&self) -> Vec<Arc<Agent>> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Ready agents, sorted by name for stable tool listings.
    pub fn list_ready(&self) -> Vec<Arc<Agent>> {
        let mut ready: Vec<Arc<Agent>> = self
            .agents
            .iter()
            .filter(|entry| entry.value().status.as_ref().is_some_and(|s| s.ready))
            .map(|entry| entry.value().clone())
            .collect();
        ready.sort_by_key(|a| a.name_any());
        ready
    }

    /// First agent with the given name, any namespace.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents
            .iter()
            .find(|entry| entry.value().name_any() == name)
            .map(|entry| entry.value().clone())
    }

    /// Insert directly; for tests.
    pub fn insert(&self, agent: Agent) {
        self.agents.insert(agent_key(&agent), Arc::new(agent));
        self.refresh_ready_set();
    }

    fn refresh_ready_set(&self) {
        let next: BTreeSet<String> = self
            .agents
            .iter()
            .filter(|entry| entry.value().status.as_ref().is_some_and(|s| s.ready))
            .map(|entry| entry.key().clone())
            .collect();

        let mut current = self.ready_set.lock();
        if *current != next {
            *current = next;
            // Nobody subscribed yet is fine
            let _ = self.changed_tx.send(());
        }
    }
}

fn agent_key(agent: &Agent) -> String {
    format!("{}/{}", agent.namespace().unwrap_or_default(), agent.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_operator::crds::{AgentSpec, AgentStatus, ModelConfig};

    fn agent(name: &str, ready: bool) -> Agent {
        let mut agent = Agent::new(
            name,
            AgentSpec {
                prompt: "p".to_string(),
                model: ModelConfig {
                    provider: "anthropic".to_string(),
                    model_id: "claude-sonnet-4-20250514".to_string(),
                    temperature: None,
                    max_tokens: None,
                    endpoint: None,
                },
                tool_refs: Vec::new(),
                policy: None,
                network: None,
                replicas: 1,
                resources: None,
                image: None,
                service_account_name: None,
                env: Default::default(),
                env_from_secrets: Vec::new(),
                env_from: Vec::new(),
                node_selector: Default::default(),
                tools: Vec::new(),
            },
        );
        agent.metadata.namespace = Some("agents".to_string());
        agent.status = Some(AgentStatus {
            ready,
            endpoint: ready.then(|| format!("{name}.agents.svc.cluster.local:8080")),
            ..Default::default()
        });
        agent
    }

    #[test]
    fn test_list_ready_filters_and_sorts() {
        let watcher = AgentWatcher::new();
        watcher.insert(agent("zeta", true));
        watcher.insert(agent("alpha", true));
        watcher.insert(agent("down", false));

        let ready = watcher.list_ready();
        let names: Vec<String> = ready.iter().map(|a| a.name_any()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_ready_set_change_notifies_subscribers() {
        let watcher = AgentWatcher::new();
        let mut rx = watcher.subscribe();

        watcher.insert(agent("alpha", true));
        assert!(rx.try_recv().is_ok());

        // Re-inserting with the same readiness is not a change
        watcher.insert(agent("alpha", true));
        assert!(rx.try_recv().is_err());

        watcher.insert(agent("alpha", false));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_get_by_name() {
        let watcher = AgentWatcher::new();
        watcher.insert(agent("alpha", true));
        assert!(watcher.get_by_name("alpha").is_some());
        assert!(watcher.get_by_name("missing").is_none());
    }
}
