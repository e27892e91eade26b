use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::time::Duration;

use crate::error::RepositoryError;

/// Database-assigned identifier for a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerId(pub i64);

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A CI runner registered with the coordination service.
///
/// `id`, `created` and `updated` are assigned by storage. A runner that has
/// not been created yet has no id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: Option<RunnerId>,
    /// Globally unique authentication token.
    pub token: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Whether the runner may pick up jobs that carry no tags.
    pub run_untagged: bool,
    pub locked: bool,
    /// Job timeout cap. `None` means the system default applies.
    pub max_timeout: Option<Duration>,
    pub active: bool,
    /// Logical deletion flag; rows are retired, never removed.
    pub deleted: bool,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

impl Runner {
    /// Create an uncreated runner with the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// Check whether this runner may be passed to a create operation.
    pub fn can_create(&self) -> Result<(), RepositoryError> {
        if self.id.is_some() {
            return Err(RepositoryError::HasId);
        }
        if self.token.is_empty() {
            return Err(RepositoryError::NoToken);
        }
        Ok(())
    }

    /// Return the assigned id, or `NoId` if the runner was never created.
    pub fn require_id(&self) -> Result<RunnerId, RepositoryError> {
        self.id.ok_or(RepositoryError::NoId)
    }
}

/// Split a comma-separated tag list, trimming whitespace and dropping empties.
pub fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_create_requires_token() {
        let runner = Runner::default();
        assert!(matches!(runner.can_create(), Err(RepositoryError::NoToken)));

        let runner = Runner::new("abc");
        assert!(runner.can_create().is_ok());
    }

    #[test]
    fn test_can_create_rejects_preset_id() {
        let mut runner = Runner::new("abc");
        runner.id = Some(RunnerId(7));
        assert!(matches!(runner.can_create(), Err(RepositoryError::HasId)));
    }

    #[test]
    fn test_require_id() {
        let mut runner = Runner::new("abc");
        assert!(matches!(runner.require_id(), Err(RepositoryError::NoId)));

        runner.id = Some(RunnerId(3));
        assert_eq!(runner.require_id().unwrap(), RunnerId(3));
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(parse_tags("docker, linux,,  shared "), vec!["docker", "linux", "shared"]);
        assert!(parse_tags("").is_empty());
        assert!(parse_tags(" , ,").is_empty());
    }

    #[test]
    fn test_runner_serde_roundtrip() {
        let mut runner = Runner::new("xyz");
        runner.id = Some(RunnerId(12));
        runner.tags = vec!["linux".to_string()];
        runner.max_timeout = Some(Duration::from_secs(3600));

        let json = serde_json::to_string(&runner).unwrap();
        assert!(json.contains("\"id\":12"));

        let parsed: Runner = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, runner);
    }
}
