use thiserror::Error;

/// Link transport errors. Both variants are transient: the supervisor
/// handles them with backoff-and-retry and never surfaces them to the
/// caller that armed auto mode.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}
