//! Tracing advice for pipeline stages.
//!
//! Wraps a stage to emit structured events for each pass-through without
//! touching the stage itself. Applied at composition time:
//!
//! ```ignore
//! let pipe = Pipe::builder()
//!     .stage(Instrumented::new(AuditStage::new(), "audit"))
//!     .build();
//! ```

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::PipeContext;

use super::{Next, PipeError, Result, Stage};

/// Wrapper that adds tracing instrumentation to any stage.
pub struct Instrumented<S> {
    inner: S,
    label: &'static str,
}

impl<S> Instrumented<S> {
    /// Wrap a stage.
    ///
    /// # Arguments
    /// * `inner` - The stage to wrap
    /// * `label` - Stage label for log events
    pub fn new(inner: S, label: &'static str) -> Self {
        Self { inner, label }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<C, S> Stage<C> for Instrumented<S>
where
    C: PipeContext,
    S: Stage<C>,
{
    async fn handle(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()> {
        let start = Instant::now();

        let result = self.inner.handle(ctx, next).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => debug!(stage = self.label, elapsed_ms, "Stage completed"),
            Err(PipeError::Cancelled) => {
                debug!(stage = self.label, elapsed_ms, "Stage observed cancellation");
            }
            Err(error) => {
                warn!(stage = self.label, elapsed_ms, error = %error, "Stage faulted");
            }
        }

        result
    }
}
