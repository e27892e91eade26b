use thiserror::Error;

/// Errors from storage operations (used by trait definitions in gribble-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The pool was exhausted, closed, or acquisition was cancelled.
    #[error("no connection")]
    NoConnection,

    #[error("resource not found")]
    NotFound,

    #[error("resource ID is not set")]
    NoId,

    /// Returned for resources whose IDs must be assigned by the database.
    #[error("cannot preassign an ID to this resource")]
    HasId,

    #[error("runner requires a token")]
    NoToken,

    #[error("operation cancelled")]
    Cancelled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("query error: {0}")]
    Query(String),

    /// Rolling back a failed savepoint itself failed.
    ///
    /// `original` is the failure that triggered the rollback. If releasing the
    /// savepoint also failed afterwards, that failure is kept in `release`.
    #[error(
        "error rolling back to savepoint {savepoint:?}: {cause} (caused by: {original}){}",
        release_suffix(.release)
    )]
    Rollback {
        savepoint: String,
        cause: Box<RepositoryError>,
        original: Box<RepositoryError>,
        release: Option<Box<RepositoryError>>,
    },

    #[error("error releasing savepoint {savepoint:?}: {cause}")]
    Release {
        savepoint: String,
        cause: Box<RepositoryError>,
    },
}

fn release_suffix(release: &Option<Box<RepositoryError>>) -> String {
    match release {
        Some(err) => format!("; release also failed: {err}"),
        None => String::new(),
    }
}
