//! Migration plan: stacks, replication endpoints, phases and settings
//!
//! ```toml
//! name = "orders"
//!
//! [replication]
//! source = "orders-db-old"
//! target = "orders-db-new"
//!
//! [[stacks]]
//! id = "network"
//! role = "network"
//!
//! [[stacks]]
//! id = "database"
//! role = "database"
//! depends_on = ["network"]
//!
//! [[phases]]
//! name = "baseline"
//! weight = { old = 100, new = 0 }
//! max_lag = 5000
//! max_error_rate = 0.01
//!
//! [[phases]]
//! name = "full"
//! weight = { old = 0, new = 100 }
//! max_lag = 5000
//! max_error_rate = 0.01
//! ```

use crate::config::MigrationSettings;
use crate::error::ConfigError;
use cutover_graph::{GraphError, StackGraph, StackId, StackStatus};
use cutover_traffic::PhasePlan;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a stack contributes to the new environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackRole {
    /// VPC, subnets, gateways
    Network,
    /// Security groups, IAM, keys
    Security,
    /// Target database; replication starts once all of these are ready
    Database,
    /// Replication task and endpoints
    Replication,
    /// Services, functions, containers
    Compute,
    /// Load balancers, weighted DNS
    Routing,
    /// Dashboards and alarms
    Monitoring,
    /// Anything else
    #[default]
    Other,
}

/// One deployable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSpec {
    /// Stack id
    pub id: StackId,
    /// Stacks that must be ready first
    #[serde(default)]
    pub depends_on: Vec<StackId>,
    /// Role
    #[serde(default)]
    pub role: StackRole,
}

impl StackSpec {
    /// Declare a stack
    pub fn new(id: impl Into<StackId>, role: StackRole, depends_on: &[&str]) -> Self {
        Self {
            id: id.into(),
            depends_on: depends_on.iter().map(|d| StackId::from(*d)).collect(),
            role,
        }
    }
}

/// Databases kept in sync during the migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSpec {
    /// Old environment database
    pub source: String,
    /// New environment database
    pub target: String,
}

/// Everything needed to run one migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Plan name; also the persistence key
    pub name: String,
    /// Stacks in declaration order
    pub stacks: Vec<StackSpec>,
    /// Replication endpoints
    pub replication: ReplicationSpec,
    /// Rollout phases
    pub phases: PhasePlan,
    /// Tunables
    #[serde(default)]
    pub settings: MigrationSettings,
}

impl MigrationPlan {
    /// Parse and validate a TOML plan
    ///
    /// # Errors
    /// `Parse` for malformed TOML or phases, otherwise whatever
    /// [`Self::validate`] reports
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let plan: Self = toml::from_str(source)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Read, parse and validate a TOML plan file
    ///
    /// # Errors
    /// `Read` if the file cannot be read, otherwise as [`Self::from_toml_str`]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check the plan as a whole
    ///
    /// # Errors
    /// - `InvalidSetting` for an empty name, no stacks, a bad setting, or a
    ///   hard ceiling not above every advance ceiling
    /// - `Graph` for duplicate ids, cycles, or dependencies on undeclared
    ///   stacks
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.stacks.is_empty() {
            return Err(ConfigError::invalid("stacks", "need at least one stack"));
        }
        if self.replication.source == self.replication.target {
            return Err(ConfigError::invalid(
                "replication",
                "source and target must differ",
            ));
        }
        self.settings.validate()?;

        let hard = self.settings.guard.hard_error_rate;
        if let Some(phase) = self.phases.iter().find(|p| p.max_error_rate >= hard) {
            return Err(ConfigError::invalid(
                "guard.hard_error_rate",
                format!(
                    "{hard} must be above every advance ceiling; phase {} allows {}",
                    phase.name, phase.max_error_rate
                ),
            ));
        }

        self.graph()?.topological_order()?;
        Ok(())
    }

    /// Build a fresh graph of the plan's stacks
    ///
    /// # Errors
    /// `DuplicateNode` or `CycleDetected`
    pub fn graph(&self) -> Result<StackGraph, GraphError> {
        let mut graph = StackGraph::new();
        for stack in &self.stacks {
            let deps: Vec<&str> = stack.depends_on.iter().map(StackId::as_str).collect();
            graph.add_node(stack.id.clone(), &deps)?;
        }
        Ok(graph)
    }

    /// Ids of `Database` stacks
    pub fn database_stacks(&self) -> impl Iterator<Item = &StackId> + '_ {
        self.stacks
            .iter()
            .filter(|s| s.role == StackRole::Database)
            .map(|s| &s.id)
    }

    /// Whether every `Database` stack is ready in `graph`
    #[must_use]
    pub fn databases_ready(&self, graph: &StackGraph) -> bool {
        self.database_stacks()
            .all(|id| graph.status(id.as_str()) == Some(StackStatus::Ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"
        name = "orders"

        [replication]
        source = "orders-db-old"
        target = "orders-db-new"

        [[stacks]]
        id = "network"
        role = "network"

        [[stacks]]
        id = "database"
        role = "database"
        depends_on = ["network"]

        [[stacks]]
        id = "compute"
        role = "compute"
        depends_on = ["database"]

        [[phases]]
        name = "baseline"
        weight = { old = 100, new = 0 }
        max_lag = 5000
        max_error_rate = 0.01

        [[phases]]
        name = "canary"
        weight = { old = 90, new = 10 }
        min_dwell = 60000
        max_lag = 5000
        max_error_rate = 0.01

        [[phases]]
        name = "full"
        weight = { old = 0, new = 100 }
        max_lag = 5000
        max_error_rate = 0.01

        [settings]
        tick_interval = 1000
    "#;

    #[test]
    fn parses_a_complete_plan() {
        let plan = MigrationPlan::from_toml_str(PLAN).unwrap();
        assert_eq!(plan.name, "orders");
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.settings.tick_interval.as_millis(), 1000);
        assert_eq!(
            plan.database_stacks().cloned().collect::<Vec<_>>(),
            vec![StackId::from("database")]
        );
        assert_eq!(
            plan.graph().unwrap().topological_order().unwrap(),
            vec![
                StackId::from("network"),
                StackId::from("database"),
                StackId::from("compute")
            ]
        );
    }

    #[test]
    fn cycles_fail_validation() {
        let cyclic = PLAN.replace(
            "id = \"network\"\n        role = \"network\"",
            "id = \"network\"\n        role = \"network\"\n        depends_on = [\"compute\"]",
        );
        let err = MigrationPlan::from_toml_str(&cyclic).unwrap_err();
        assert!(matches!(err, ConfigError::Graph(GraphError::CycleDetected(_))));
    }

    #[test]
    fn undeclared_dependency_fails_validation() {
        let dangling = PLAN.replace("depends_on = [\"database\"]", "depends_on = [\"cache\"]");
        let err = MigrationPlan::from_toml_str(&dangling).unwrap_err();
        assert!(matches!(err, ConfigError::Graph(GraphError::UnknownNode(_))));
    }

    #[test]
    fn phases_that_do_not_finish_on_new_are_rejected() {
        let short = PLAN.replace("weight = { old = 0, new = 100 }", "weight = { old = 20, new = 80 }");
        assert!(matches!(
            MigrationPlan::from_toml_str(&short),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn hard_ceiling_must_sit_above_advance_ceilings() {
        let loose = PLAN.replace("tick_interval = 1000", "tick_interval = 1000\n[settings.guard]\nhard_error_rate = 0.01");
        let err = MigrationPlan::from_toml_str(&loose).unwrap_err();
        assert!(err.to_string().contains("guard.hard_error_rate"));
    }
}
