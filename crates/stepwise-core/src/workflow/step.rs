//! Step handlers and descriptors.
//!
//! A step is registered as a `StepDescriptor`: an immutable `StepConfig` plus
//! a handler implementing [`Step`]. Handlers receive the run's `Context` and
//! the event that triggered them, and return zero or one event.
//!
//! Follows the same pattern as the other RPITIT traits in this crate:
//! 1. `Step` uses return-position `impl Future` for ergonomic implementations
//! 2. `StepDyn` is the object-safe twin with boxed futures
//! 3. A blanket impl bridges the two so descriptors can store `Arc<dyn StepDyn>`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stepwise_types::event::Event;
use stepwise_types::workflow::StepConfig;

use super::context::Context;

/// What a step handler returns: an optional output event, or an error that
/// aborts the run.
pub type StepResult = anyhow::Result<Option<Event>>;

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// Workflow step logic.
pub trait Step: Send + Sync {
    /// Handle one accepted event.
    fn run(&self, ctx: Context, event: Event) -> impl Future<Output = StepResult> + Send;
}

/// Object-safe version of [`Step`] with a boxed future.
pub trait StepDyn: Send + Sync {
    fn run_boxed(
        &self,
        ctx: Context,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = StepResult> + Send + '_>>;
}

impl<T: Step> StepDyn for T {
    fn run_boxed(
        &self,
        ctx: Context,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = StepResult> + Send + '_>> {
        Box::pin(self.run(ctx, event))
    }
}

/// Adapts an async closure into a [`Step`].
pub struct FnStep<F> {
    f: F,
}

impl<F> FnStep<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(Context, Event) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult> + Send,
{
    fn run(&self, ctx: Context, event: Event) -> impl Future<Output = StepResult> + Send {
        (self.f)(ctx, event)
    }
}

// ---------------------------------------------------------------------------
// StepDescriptor
// ---------------------------------------------------------------------------

/// A registered step: static configuration plus its handler.
#[derive(Clone)]
pub struct StepDescriptor {
    config: StepConfig,
    handler: Arc<dyn StepDyn>,
}

impl StepDescriptor {
    pub fn new<S: Step + 'static>(config: StepConfig, step: S) -> Self {
        Self {
            config,
            handler: Arc::new(step),
        }
    }

    /// Register an async closure as the handler.
    pub fn from_fn<F, Fut>(config: StepConfig, f: F) -> Self
    where
        F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        Self::new(config, FnStep::new(f))
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Run the handler directly, bypassing the scheduler.
    pub async fn invoke(&self, ctx: Context, event: Event) -> StepResult {
        self.handler.run_boxed(ctx, event).await
    }

    pub(crate) fn handler(&self) -> Arc<dyn StepDyn> {
        Arc::clone(&self.handler)
    }
}

impl std::fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
