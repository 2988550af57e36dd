//! Progress reporting capability injected into long-running operations.
//!
//! The core never talks to a UI directly; it emits [`ProgressEvent`]s through a
//! [`Reporter`] and periodically yields via [`Reporter::tick`] so the consumer
//! can service its own event loop.

/// One progress notification from a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent<'a> {
    /// A new phase has begun (short status line).
    Status(&'a str),
    /// The path currently being visited.
    Path(&'a str),
    /// A file was written to the output sink.
    Saved(&'a str),
    /// Free-form informational text.
    Info(String),
}

pub trait Reporter {
    fn report(&mut self, event: ProgressEvent<'_>);

    /// Cooperative maintenance tick. Called at coarse intervals (per directory,
    /// per file written) so the presentation layer stays responsive; there is
    /// no concurrency behind this, it is a plain synchronous callout.
    fn tick(&mut self) {}
}

/// Reporter that discards everything.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&mut self, _event: ProgressEvent<'_>) {}
}
