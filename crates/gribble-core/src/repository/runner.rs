//! Runner repository trait definition.

use chrono::{DateTime, Utc};
use gribble_types::error::RepositoryError;
use gribble_types::runner::Runner;
use tokio_util::sync::CancellationToken;

/// Repository trait for runner persistence.
///
/// Every operation takes a cancellation token; a cancelled token aborts
/// connection acquisition and any statements not yet issued.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunnerRepository: Send + Sync {
    /// Create a runner and link its tags, all-or-nothing.
    ///
    /// On success `runner` is replaced with the stored version (id and
    /// timestamps populated). On failure `runner` is left untouched.
    fn create_runner(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Make the runner's stored tag set exactly equal to `tags`.
    fn tag_runner(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
        tags: &[String],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Set the runner's updated timestamp.
    fn set_runner_updated_time(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
        time: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Look a runner up by token. Deleted runners are `NotFound` unless
    /// `include_deleted` is set. Tags are not loaded.
    fn get_runner_by_token(
        &self,
        cancel: &CancellationToken,
        token: &str,
        include_deleted: bool,
    ) -> impl std::future::Future<Output = Result<Runner, RepositoryError>> + Send;

    /// Load the runner's tags, sorted, into `runner.tags`.
    fn get_runner_tags(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark the runner deleted.
    fn retire_runner(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
