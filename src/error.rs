use thiserror::Error;

/// Failure taxonomy for the platform.
///
/// `NotFound` and `Conflict` are ordinary response values that callers are
/// expected to check; background subsystems log and swallow everything.
#[derive(Error, Debug)]
pub enum Error {
    /// Connect/IO error while reaching a peer.
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),

    /// Malformed response or broken wire framing.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// Peer answered with an unexpected HTTP status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Missing table, row, or column.
    #[error("not found: {0}")]
    NotFound(String),

    /// CAS mismatch or rename collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid request (e.g. persistence-class mismatch on rename).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Malformed or unresolvable job entry point / operator function.
    #[error("bad submission: {0}")]
    BadSubmission(String),

    /// A job's own logic failed.
    #[error("job failed: {0}")]
    Job(String),

    /// A partition of a distributed operation failed after others may have
    /// already written to the shared output table.
    #[error("partial write: {0}")]
    PartialWrite(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
