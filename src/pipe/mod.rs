//! Composable dispatch pipelines.
//!
//! This module contains:
//! - `Stage` trait: one link of an ordered processing chain
//! - `Pipe`: a statically composed chain executed once per delivery
//! - `Next`: the tail of the chain a stage forwards to
//! - `RunOutcome`: the mutually exclusive terminal states of a run
//!
//! A stage must either forward to `next` exactly once or terminate the chain
//! deliberately. Cancellation is cooperative: the driver checks the token
//! before entering each stage, and stages are expected to check it before
//! expensive work.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::PipeContext;

pub mod instrument;
pub mod transform;

pub use instrument::Instrumented;
pub use transform::TransformStage;

/// Boxed error carried by stage faults.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, PipeError>;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// A stage returned an error; the run ends `Faulted`. Faults surface to
    /// the dispatch layer unchanged; the pipe never retries.
    #[error("stage '{stage}' faulted: {source}")]
    Stage {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// The run observed its cancellation token; the run ends `Cancelled`.
    #[error("pipeline run was cancelled")]
    Cancelled,
}

impl PipeError {
    pub fn stage(stage: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: source.into(),
        }
    }
}

/// Terminal state of a single pipe execution.
///
/// One run is one `execute` call, so a run reaches exactly one of these.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Faulted(PipeError),
    Cancelled,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// One link of a pipe.
#[async_trait]
pub trait Stage<C: PipeContext>: Send + Sync {
    async fn handle(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()>;
}

/// The remainder of the chain after the current stage.
pub struct Next<'a, C> {
    stages: &'a [Arc<dyn Stage<C>>],
}

impl<'a, C: PipeContext> Next<'a, C> {
    /// Forward the context to the rest of the chain.
    ///
    /// Checks the cancellation token before entering the next stage, the
    /// "before forwarding" safe point every run passes through.
    pub fn run(self, ctx: &'a mut C) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if ctx.cancellation().is_cancelled() {
                return Err(PipeError::Cancelled);
            }
            match self.stages.split_first() {
                Some((stage, rest)) => stage.handle(ctx, Next { stages: rest }).await,
                None => Ok(()),
            }
        })
    }
}

/// An ordered chain of stages. Composition is static: the stage list is
/// fixed at `build` and executes in order on every run.
pub struct Pipe<C> {
    stages: Arc<[Arc<dyn Stage<C>>]>,
}

impl<C> Clone for Pipe<C> {
    fn clone(&self) -> Self {
        Self {
            stages: Arc::clone(&self.stages),
        }
    }
}

impl<C: PipeContext> Pipe<C> {
    pub fn builder() -> PipeBuilder<C> {
        PipeBuilder { stages: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the context through the chain once.
    pub async fn execute(&self, ctx: &mut C) -> RunOutcome {
        let next = Next {
            stages: &self.stages[..],
        };
        match next.run(ctx).await {
            Ok(()) => RunOutcome::Completed,
            Err(PipeError::Cancelled) => RunOutcome::Cancelled,
            Err(error) => RunOutcome::Faulted(error),
        }
    }
}

pub struct PipeBuilder<C> {
    stages: Vec<Arc<dyn Stage<C>>>,
}

impl<C: PipeContext> PipeBuilder<C> {
    pub fn stage<S: Stage<C> + 'static>(self, stage: S) -> Self {
        self.stage_arc(Arc::new(stage))
    }

    pub fn stage_arc(mut self, stage: Arc<dyn Stage<C>>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Pipe<C> {
        Pipe {
            stages: self.stages.into(),
        }
    }
}
