use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};
use weave_core::{AgentId, WeaveError, WeaveResult};

/// Load at which an agent stops receiving new work when none is configured.
pub const DEFAULT_MAX_LOAD: usize = 4;

/// Availability of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Below the load threshold.
    #[default]
    Idle,
    /// At the load threshold.
    Busy,
    /// Never selected.
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// What the registry knows about one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Tasks currently assigned and not yet released.
    pub load: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Registration order, the tie-break between equally loaded agents.
    pub sequence: u64,
    pub registered_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AgentDescriptor {
    /// Whether the agent serves `tag`, either as its type or as a capability.
    pub fn serves(&self, tag: &str) -> bool {
        self.agent_type == tag || self.capabilities.contains(tag)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}

/// Counts reported by [`AgentRegistry::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub offline_agents: usize,
    pub agent_types: usize,
    pub capabilities: usize,
    pub total_load: usize,
    pub tasks_processed: u64,
    pub tasks_completed: u64,
    pub success_rate: f64,
}

#[derive(Default)]
struct RegistryInner {
    agents: HashMap<AgentId, AgentDescriptor>,
    next_sequence: u64,
}

impl RegistryInner {
    fn agent_mut(&mut self, id: &str) -> WeaveResult<&mut AgentDescriptor> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| WeaveError::Validation(format!("Unknown agent '{id}'")))
    }

    /// Least-loaded eligible agent; ties go to the earliest registration.
    fn select(&self, max_load: usize, pred: impl Fn(&AgentDescriptor) -> bool) -> Option<AgentId> {
        self.agents
            .values()
            .filter(|a| a.status != AgentStatus::Offline && a.load < max_load && pred(a))
            .min_by_key(|a| (a.load, a.sequence))
            .map(|a| a.id.clone())
    }
}

/// Catalog of agents with load-balanced selection.
///
/// Selection and load changes happen under one lock, so two concurrent
/// assignments can never push an agent past its threshold.
pub struct AgentRegistry {
    inner: Mutex<RegistryInner>,
    max_load: usize,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_max_load(DEFAULT_MAX_LOAD)
    }

    /// Registry whose agents turn busy at `max_load` concurrent tasks.
    pub fn with_max_load(max_load: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_load: max_load.max(1),
        }
    }

    pub fn max_load(&self) -> usize {
        self.max_load
    }

    fn status_for(&self, load: usize) -> AgentStatus {
        if load >= self.max_load {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        }
    }

    /// Register (or re-register) an agent. Re-registration replaces type and
    /// capabilities but keeps the original registration order, counters and
    /// in-flight load.
    pub fn register(
        &self,
        id: impl Into<AgentId>,
        agent_type: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> AgentDescriptor {
        let id = id.into();
        let agent_type = agent_type.into();
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let now = Utc::now();

        let mut inner = self.inner.lock();
        let descriptor = match inner.agents.get(&id).cloned() {
            Some(existing) => AgentDescriptor {
                agent_type,
                capabilities,
                status: self.status_for(existing.load),
                last_active: now,
                ..existing
            },
            None => {
                let sequence = inner.next_sequence;
                inner.next_sequence += 1;
                AgentDescriptor {
                    id: id.clone(),
                    agent_type,
                    capabilities,
                    status: AgentStatus::Idle,
                    load: 0,
                    tasks_completed: 0,
                    tasks_failed: 0,
                    sequence,
                    registered_at: now,
                    last_active: now,
                }
            }
        };
        inner.agents.insert(id.clone(), descriptor.clone());
        drop(inner);

        info!(
            agent = %id,
            agent_type = %descriptor.agent_type,
            capabilities = descriptor.capabilities.len(),
            "Agent registered"
        );
        descriptor
    }

    /// Take an agent out of rotation. The descriptor is kept for lookups.
    pub fn unregister(&self, id: &str) -> WeaveResult<()> {
        let mut inner = self.inner.lock();
        let agent = inner.agent_mut(id)?;
        agent.status = AgentStatus::Offline;
        agent.last_active = Utc::now();
        info!(agent = %id, "Agent unregistered");
        Ok(())
    }

    /// Force an agent offline, or bring it back. Any non-offline status is
    /// recomputed from the agent's load.
    pub fn set_status(&self, id: &str, status: AgentStatus) -> WeaveResult<()> {
        let max_load = self.max_load;
        let mut inner = self.inner.lock();
        let agent = inner.agent_mut(id)?;
        agent.status = match status {
            AgentStatus::Offline => AgentStatus::Offline,
            _ if agent.load >= max_load => AgentStatus::Busy,
            _ => AgentStatus::Idle,
        };
        Ok(())
    }

    /// Least-loaded available agent matching every given filter.
    pub fn find_available(
        &self,
        agent_type: Option<&str>,
        capability: Option<&str>,
    ) -> Option<AgentDescriptor> {
        let inner = self.inner.lock();
        let id = inner.select(self.max_load, |a| {
            agent_type.map_or(true, |t| a.agent_type == t)
                && capability.map_or(true, |c| a.capabilities.contains(c))
        })?;
        inner.agents.get(&id).cloned()
    }

    /// Least-loaded available agent whose type or capabilities include `tag`.
    pub fn find_for_requirement(&self, tag: &str) -> Option<AgentDescriptor> {
        let inner = self.inner.lock();
        let id = inner.select(self.max_load, |a| a.serves(tag))?;
        inner.agents.get(&id).cloned()
    }

    /// Pick the least-loaded agent for `tag` and charge it one unit of load,
    /// atomically.
    pub fn assign(&self, tag: &str) -> WeaveResult<AgentDescriptor> {
        let max_load = self.max_load;
        let mut inner = self.inner.lock();
        let id = inner
            .select(max_load, |a| a.serves(tag))
            .ok_or_else(|| WeaveError::NoAvailableAgent(tag.to_string()))?;
        let agent = inner.agent_mut(&id)?;
        agent.load += 1;
        agent.last_active = Utc::now();
        if agent.load >= max_load {
            agent.status = AgentStatus::Busy;
        }
        debug!(agent = %id, load = agent.load, requirement = %tag, "Agent assigned");
        Ok(agent.clone())
    }

    /// Returns the new load.
    pub fn increment_load(&self, id: &str) -> WeaveResult<usize> {
        let max_load = self.max_load;
        let mut inner = self.inner.lock();
        let agent = inner.agent_mut(id)?;
        agent.load += 1;
        agent.last_active = Utc::now();
        if agent.status != AgentStatus::Offline && agent.load >= max_load {
            agent.status = AgentStatus::Busy;
        }
        Ok(agent.load)
    }

    /// Returns the new load. Never goes below zero.
    pub fn decrement_load(&self, id: &str) -> WeaveResult<usize> {
        let max_load = self.max_load;
        let mut inner = self.inner.lock();
        let agent = inner.agent_mut(id)?;
        agent.load = agent.load.saturating_sub(1);
        agent.last_active = Utc::now();
        if agent.status != AgentStatus::Offline && agent.load < max_load {
            agent.status = AgentStatus::Idle;
        }
        Ok(agent.load)
    }

    pub fn record_completion(&self, id: &str) -> WeaveResult<()> {
        let mut inner = self.inner.lock();
        let agent = inner.agent_mut(id)?;
        agent.tasks_completed += 1;
        agent.last_active = Utc::now();
        Ok(())
    }

    pub fn record_failure(&self, id: &str) -> WeaveResult<()> {
        let mut inner = self.inner.lock();
        let agent = inner.agent_mut(id)?;
        agent.tasks_failed += 1;
        agent.last_active = Utc::now();
        Ok(())
    }

    /// Release one unit of load and record the outcome.
    pub fn release(&self, id: &str, success: bool) -> WeaveResult<usize> {
        if success {
            self.record_completion(id)?;
        } else {
            self.record_failure(id)?;
        }
        self.decrement_load(id)
    }

    pub fn success_rate(&self, id: &str) -> Option<f64> {
        self.inner.lock().agents.get(id).map(AgentDescriptor::success_rate)
    }

    pub fn get(&self, id: &str) -> Option<AgentDescriptor> {
        self.inner.lock().agents.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().agents.contains_key(id)
    }

    /// All agents in registration order.
    pub fn all(&self) -> Vec<AgentDescriptor> {
        let inner = self.inner.lock();
        let mut agents: Vec<AgentDescriptor> = inner.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.sequence);
        agents
    }

    pub fn by_type(&self, agent_type: &str) -> Vec<AgentDescriptor> {
        self.all()
            .into_iter()
            .filter(|a| a.agent_type == agent_type)
            .collect()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<AgentDescriptor> {
        self.all()
            .into_iter()
            .filter(|a| a.capabilities.contains(capability))
            .collect()
    }

    /// Distinct agent types, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let types: BTreeSet<String> = inner.agents.values().map(|a| a.agent_type.clone()).collect();
        types.into_iter().collect()
    }

    /// Distinct capabilities across all agents, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let caps: BTreeSet<String> = inner
            .agents
            .values()
            .flat_map(|a| a.capabilities.iter().cloned())
            .collect();
        caps.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let agents = self.all();
        let mut stats = RegistryStatistics {
            total_agents: agents.len(),
            agent_types: self.agent_types().len(),
            capabilities: self.capabilities().len(),
            ..Default::default()
        };
        for agent in &agents {
            match agent.status {
                AgentStatus::Idle => stats.idle_agents += 1,
                AgentStatus::Busy => stats.busy_agents += 1,
                AgentStatus::Offline => stats.offline_agents += 1,
            }
            stats.total_load += agent.load;
            stats.tasks_processed += agent.tasks_completed + agent.tasks_failed;
            stats.tasks_completed += agent.tasks_completed;
        }
        if stats.tasks_processed > 0 {
            stats.success_rate = stats.tasks_completed as f64 / stats.tasks_processed as f64;
        }
        stats
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.agents.clear();
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        let reg = AgentRegistry::with_max_load(2);
        reg.register("r1", "researcher", ["search", "summarize"]);
        reg.register("r2", "researcher", ["search"]);
        reg.register("w1", "writer", ["draft"]);
        reg
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = registry();
        assert_eq!(reg.len(), 3);
        let r1 = reg.get("r1").unwrap();
        assert_eq!(r1.status, AgentStatus::Idle);
        assert!(r1.capabilities.contains("summarize"));
        assert_eq!(reg.agent_types(), vec!["researcher", "writer"]);
        assert_eq!(reg.capabilities(), vec!["draft", "search", "summarize"]);
        assert_eq!(reg.by_type("researcher").len(), 2);
        assert_eq!(reg.by_capability("search").len(), 2);
    }

    #[test]
    fn test_least_loaded_wins() {
        let reg = registry();
        reg.increment_load("r1").unwrap();
        let picked = reg.find_available(Some("researcher"), None).unwrap();
        assert_eq!(picked.id, "r2");
    }

    #[test]
    fn test_tie_goes_to_earliest_registration() {
        let reg = registry();
        let picked = reg.find_available(None, Some("search")).unwrap();
        assert_eq!(picked.id, "r1");
    }

    #[test]
    fn test_filters_combine() {
        let reg = registry();
        assert!(reg.find_available(Some("writer"), Some("search")).is_none());
        assert_eq!(
            reg.find_available(Some("researcher"), Some("summarize")).unwrap().id,
            "r1"
        );
    }

    #[test]
    fn test_offline_never_selected() {
        let reg = registry();
        reg.unregister("w1").unwrap();
        assert!(reg.find_available(Some("writer"), None).is_none());
        assert!(reg.assign("writer").is_err());
        // Descriptor survives unregistration.
        assert_eq!(reg.get("w1").unwrap().status, AgentStatus::Offline);
    }

    #[test]
    fn test_requirement_matches_type_or_capability() {
        let reg = registry();
        assert_eq!(reg.find_for_requirement("writer").unwrap().id, "w1");
        assert_eq!(reg.find_for_requirement("draft").unwrap().id, "w1");
        assert!(reg.find_for_requirement("translate").is_none());
    }

    #[test]
    fn test_assign_balances_and_saturates() {
        let reg = registry();
        let picks: Vec<String> = (0..4).map(|_| reg.assign("search").unwrap().id).collect();
        assert_eq!(picks, vec!["r1", "r2", "r1", "r2"]);
        assert_eq!(reg.get("r1").unwrap().status, AgentStatus::Busy);

        let err = reg.assign("search").unwrap_err();
        assert!(matches!(err, WeaveError::NoAvailableAgent(_)));

        reg.release("r2", true).unwrap();
        assert_eq!(reg.get("r2").unwrap().status, AgentStatus::Idle);
        assert_eq!(reg.assign("search").unwrap().id, "r2");
    }

    #[test]
    fn test_decrement_never_negative() {
        let reg = registry();
        assert_eq!(reg.decrement_load("r1").unwrap(), 0);
        assert!(reg.decrement_load("ghost").is_err());
    }

    #[test]
    fn test_success_rate() {
        let reg = registry();
        assert_eq!(reg.success_rate("r1"), Some(0.0));
        reg.record_completion("r1").unwrap();
        reg.record_completion("r1").unwrap();
        reg.record_failure("r1").unwrap();
        let rate = reg.success_rate("r1").unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(reg.success_rate("ghost").is_none());
    }

    #[test]
    fn test_reregistration_keeps_order_and_load() {
        let reg = registry();
        reg.increment_load("r1").unwrap();
        let again = reg.register("r1", "researcher", ["search", "translate"]);
        assert_eq!(again.sequence, 0);
        assert_eq!(again.load, 1);
        assert!(again.capabilities.contains("translate"));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_set_status_round_trip() {
        let reg = registry();
        reg.set_status("r1", AgentStatus::Offline).unwrap();
        assert_eq!(reg.find_for_requirement("summarize").map(|a| a.id), None);
        reg.set_status("r1", AgentStatus::Idle).unwrap();
        assert_eq!(reg.find_for_requirement("summarize").unwrap().id, "r1");
    }

    #[test]
    fn test_statistics() {
        let reg = registry();
        reg.assign("writer").unwrap();
        reg.assign("writer").unwrap();
        reg.unregister("r2").unwrap();
        reg.release("w1", false).unwrap();

        let stats = reg.statistics();
        assert_eq!(stats.total_agents, 3);
        assert_eq!(stats.idle_agents, 2);
        assert_eq!(stats.offline_agents, 1);
        assert_eq!(stats.total_load, 1);
        assert_eq!(stats.tasks_processed, 1);
        assert_eq!(stats.success_rate, 0.0);
    }
}
