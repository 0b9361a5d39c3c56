//! Task runtime shared by the long-running parts of the service.
//!
//! A [`Component`] is an independently-runnable unit (today the HTTP
//! channel; background refreshers later) that captures its shared state at
//! construction time. [`spawn_components`] runs a set of them on one
//! [`CancellationToken`]: the first failure cancels the token so the rest
//! stop cooperatively.

use std::future::Future;
use std::pin::Pin;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::AppError;

pub type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'static>>;

pub trait Component: Send + 'static {
    /// Stable identifier used in log messages.
    fn id(&self) -> &str;

    /// Consume the component and return its run-loop. The future should
    /// resolve once `shutdown` is cancelled or its work is done.
    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture;
}

/// Resolves when every spawned component has exited.
pub struct SubsystemHandle {
    inner: JoinHandle<Result<(), AppError>>,
}

impl SubsystemHandle {
    /// Await all components and return the first error, if any.
    pub async fn join(self) -> Result<(), AppError> {
        match self.inner.await {
            Ok(r) => r,
            Err(e) => Err(AppError::Server(format!("component manager panicked: {e}"))),
        }
    }
}

/// Spawn each component on its own task.
///
/// Any error or panic cancels `shutdown`; the manager then drains the
/// remaining components and reports the first error.
pub fn spawn_components(
    components: Vec<Box<dyn Component>>,
    shutdown: CancellationToken,
) -> SubsystemHandle {
    let handle = tokio::spawn(async move {
        let mut set: JoinSet<Result<(), AppError>> = JoinSet::new();

        for component in components {
            debug!(component = %component.id(), "spawning component");
            set.spawn(component.run(shutdown.clone()));
        }

        let mut first_err: Option<AppError> = None;
        while let Some(res) = set.join_next().await {
            match res {
                Err(e) => {
                    error!("component panicked: {e}");
                    shutdown.cancel();
                    first_err.get_or_insert_with(|| AppError::Server(format!("component panicked: {e}")));
                }
                Ok(Err(e)) => {
                    error!("component error: {e}");
                    shutdown.cancel();
                    first_err.get_or_insert(e);
                }
                Ok(Ok(())) => {}
            }
        }
        info!("all components stopped");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });

    SubsystemHandle { inner: handle }
}
