//! Run-level error taxonomy.
//!
//! Only fatal conditions live here. Task, stage and plan failures are values
//! carried by [`crate::PlanReport`] and the pipeline event stream; malformed
//! protocol lines never become errors at all.

use crate::config::ConfigError;
use crate::plan::PlanError;
use crate::workspace::WorkspaceError;

/// A fatal run error, categorized for reporting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("container lifecycle error: {0}")]
    ContainerLifecycle(String),

    #[error("no output for {secs}s; run cancelled")]
    IdleTimeout { secs: u64 },

    #[error("workspace isolation violation: {0}")]
    WorkspaceIsolation(PlanError),

    #[error("invalid plan: {0}")]
    Plan(PlanError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl From<PlanError> for Error {
    fn from(err: PlanError) -> Self {
        if err.is_isolation_violation() {
            Error::WorkspaceIsolation(err)
        } else {
            Error::Plan(err)
        }
    }
}

impl Error {
    /// Stable short name of the error category.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::ContainerLifecycle(_) => "container_lifecycle",
            Error::IdleTimeout { .. } => "idle_timeout",
            Error::WorkspaceIsolation(_) => "workspace_isolation",
            Error::Plan(_) => "plan",
            Error::Workspace(_) => "workspace",
            Error::Infrastructure(_) => "infrastructure",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_errors_split_by_category() {
        let isolation: Error = PlanError::WorkspaceIsolation {
            stage: "s".to_string(),
            task: "t".to_string(),
        }
        .into();
        assert_eq!(isolation.category(), "workspace_isolation");

        let structural: Error = PlanError::EmptyPlan.into();
        assert_eq!(structural.category(), "plan");
    }

    #[test]
    fn test_config_error_category() {
        let err: Error = ConfigError::MissingField("image".to_string()).into();
        assert_eq!(err.category(), "configuration");
        assert!(err.to_string().contains("image"));
    }
}
