// Agent identities are opaque strings. The registry only answers "who is
// around and what can they do"; lock ownership never consults it.

use crate::clock::SharedClock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AgentProfile {
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }
}

#[derive(Debug)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentProfile>>,
    clock: SharedClock,
}

impl AgentRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register or re-register an agent. Re-registering replaces its
    /// capability tags. Returns true for a newly seen agent.
    pub fn register<I, S>(&self, id: &str, capabilities: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = self.clock.now();
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let mut agents = self.agents.write().unwrap_or_else(|poisoned| poisoned.into_inner());

        match agents.get_mut(id) {
            Some(profile) => {
                profile.capabilities = capabilities;
                profile.last_seen = now;
                debug!(agent = %id, "Agent re-registered");
                false
            }
            None => {
                info!(agent = %id, capabilities = ?capabilities, "Agent registered");
                agents.insert(
                    id.to_string(),
                    AgentProfile {
                        id: id.to_string(),
                        capabilities,
                        registered_at: now,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn deregister(&self, id: &str) -> Option<AgentProfile> {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
        if removed.is_some() {
            info!(agent = %id, "Agent deregistered");
        }
        removed
    }

    /// Record activity from an agent, registering it without capabilities if
    /// it was unknown.
    pub fn touch(&self, id: &str) {
        let now = self.clock.now();
        let mut agents = self.agents.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        agents
            .entry(id.to_string())
            .and_modify(|profile| profile.last_seen = now)
            .or_insert_with(|| AgentProfile {
                id: id.to_string(),
                capabilities: BTreeSet::new(),
                registered_at: now,
                last_seen: now,
            });
    }

    pub fn get(&self, id: &str) -> Option<AgentProfile> {
        self.agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    /// Agents carrying `tag`, sorted by id.
    pub fn with_capability(&self, tag: &str) -> Vec<AgentProfile> {
        let mut matching: Vec<AgentProfile> = self
            .agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|profile| profile.has_capability(tag))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }

    pub fn list(&self) -> Vec<AgentProfile> {
        let mut all: Vec<AgentProfile> = self
            .agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
