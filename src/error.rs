use thiserror::Error;

/// Errors raised while wiring or running the instrumentation.
///
/// None of these escape a wrapped messaging operation: instrumentation code
/// converts them to a warning log at the outermost wrap boundary and lets the
/// underlying call proceed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// [`instrument`] was called while the extension points were already
    /// wired.
    ///
    /// [`instrument`]: crate::OutboxPatternInstrumentor::instrument
    #[error("outbox pattern instrumentation is already applied")]
    AlreadyInstrumented,

    /// A message header required to compute the span destination was absent.
    #[error("missing `{0}` message header")]
    MissingHeader(&'static str),
}
