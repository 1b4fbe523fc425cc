//! Goals and constraints.
//!
//! A goal is declarative context for an agent: what success looks like and
//! the constraints the runtime's budget guards enforce. The executor only
//! consumes constraints through [`crate::executor::ExecutionBudget`].

use serde::{Deserialize, Serialize};

/// What constraint violations cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintCategory {
    Cost,
    Quality,
    Functional,
    Safety,
}

/// Hard constraints abort the execution; soft constraints are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Hard,
    Soft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub category: ConstraintCategory,
    pub kind: ConstraintKind,
    pub description: String,
}

/// A goal an agent graph is built to achieve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Goal {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            success_criteria: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Hard constraints only, the ones budget guards must enforce.
    pub fn hard_constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::Hard)
    }
}
