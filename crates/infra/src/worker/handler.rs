//! Job handler contract.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use dmflow_core::{HandlerError, Job};

/// Business logic executed per job.
///
/// Delivery is at-least-once: a job may be processed again after a crash, a
/// timeout or a lost resolve, so implementations must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn process(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Adapts an async closure taking an owned [`Job`] into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> Result<(), HandlerError> {
        (self.f)(job.clone()).await
    }
}
