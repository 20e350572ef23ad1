//! Static stage → agent table, built once at startup

use super::stages::{AnalysisStageAgent, FactCheckAgent, FinalizeAgent, RevisionAgent};
use super::StageAgent;
use crate::model::{StageKind, StageSpec};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each stage kind to the agent that executes it
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<StageKind, Arc<dyn StageAgent>>,
}

impl AgentRegistry {
    /// Registry with no agents
    pub fn empty() -> Self {
        Self::default()
    }

    /// One agent per stage kind
    pub fn standard() -> Self {
        Self::empty()
            .with_agent(Arc::new(AnalysisStageAgent::pre_test()))
            .with_agent(Arc::new(AnalysisStageAgent::analyse()))
            .with_agent(Arc::new(AnalysisStageAgent::synthesis()))
            .with_agent(Arc::new(FactCheckAgent::default()))
            .with_agent(Arc::new(RevisionAgent::default()))
            .with_agent(Arc::new(FinalizeAgent))
    }

    /// Register `agent` for its stage, replacing any previous one
    pub fn with_agent(mut self, agent: Arc<dyn StageAgent>) -> Self {
        self.agents.insert(agent.stage(), agent);
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn StageAgent>> {
        self.agents.get(&kind).cloned()
    }

    /// Stage kinds a run would need that have no agent
    ///
    /// A listed `fact_check` implies `revision`.
    pub fn missing(&self, stages: &[StageSpec]) -> Vec<StageKind> {
        let mut needed: Vec<StageKind> = stages.iter().map(|s| s.kind).collect();
        if needed.contains(&StageKind::FactCheck) {
            needed.push(StageKind::Revision);
        }
        needed
            .into_iter()
            .filter(|kind| !self.agents.contains_key(kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_stage() {
        let registry = AgentRegistry::standard();
        assert_eq!(registry.len(), StageKind::ALL.len());
        for kind in StageKind::ALL {
            assert_eq!(registry.get(kind).map(|a| a.stage()), Some(kind));
        }
    }

    #[test]
    fn test_missing_includes_implied_revision() {
        let registry = AgentRegistry::empty()
            .with_agent(Arc::new(AnalysisStageAgent::synthesis()))
            .with_agent(Arc::new(FactCheckAgent::default()));
        let stages = [
            StageSpec::new(StageKind::Synthesis),
            StageSpec::new(StageKind::FactCheck),
        ];
        assert_eq!(registry.missing(&stages), vec![StageKind::Revision]);
        assert!(AgentRegistry::standard().missing(&stages).is_empty());
    }
}
