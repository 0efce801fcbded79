/// Errors that end a host run.
///
/// Everything a client can cause is reported back over the pipe as an `Error` event;
/// only failures of the pipe itself (or a broken configuration) surface here.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Reading the inbound pipe failed.
    #[error("failed to read from input pipe: {0}")]
    PipeRead(#[source] std::io::Error),

    /// Writing a frame to the outbound pipe failed.
    #[error("failed to write to output pipe: {0}")]
    PipeWrite(#[source] serialmux_frame::FrameError),

    /// The outbound queue has no consumer any more.
    #[error("output pipe closed")]
    PipeClosed,

    /// A host task panicked or was cancelled.
    #[error("host task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, HostError>;
