use std::{
    borrow::Cow,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tracing::{Instrument, debug, error, info, warn};

use crate::notify_once::NotifyOnce;

/// Errors returned by [`try_join_tasks_and_shutdown`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Static task finished prematurely: {name}")]
    PrematureFinish { name: Cow<'static, str> },
    #[error("Some tasks failed to finish on time: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// Runs the bridge's tasks until shutdown.
///
/// - "static" tasks (the gateway serve loop, signal handlers) should live for
///   the whole process. If one finishes early we trigger a shutdown and
///   return [`Error::PrematureFinish`].
/// - "ephemeral" tasks (one per inbound request, payment watchers) arrive
///   over `eph_tasks_rx` and may finish whenever they like.
/// - Task panics are propagated to the caller.
/// - After the shutdown signal, remaining tasks get `shutdown_timeout` to
///   finish before we give up with [`Error::Hung`].
pub async fn try_join_tasks_and_shutdown(
    static_tasks: Vec<Task<()>>,
    mut eph_tasks_rx: mpsc::Receiver<Task<()>>,
    mut shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    if static_tasks.is_empty() {
        shutdown.recv().await;
        return Ok(());
    }

    let mut static_tasks = static_tasks
        .into_iter()
        .map(Task::logged)
        .collect::<FuturesUnordered<_>>();
    let mut eph_tasks = FuturesUnordered::new();

    let mut result = Ok(());

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            Some(task) = eph_tasks_rx.recv() => {
                debug!("Received ephemeral task: {}", task.name());
                eph_tasks.push(task.logged());
            }
            Some(name) = eph_tasks.next() => {
                debug!("Ephemeral task finished: {name}");
            }
            Some(name) = static_tasks.next() => {
                result = Err(Error::PrematureFinish { name });
                break shutdown.send();
            }
        }
    }

    // Pick up any ephemeral tasks that were queued right before shutdown.
    while let Ok(task) = eph_tasks_rx.try_recv() {
        eph_tasks.push(task.logged());
    }

    let mut all_tasks = static_tasks
        .into_iter()
        .chain(eph_tasks)
        .collect::<FuturesUnordered<_>>();

    let timeout = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(timeout);

    while !all_tasks.is_empty() {
        tokio::select! {
            Some(_name) = all_tasks.next() => (),
            () = &mut timeout => {
                let hung_tasks = all_tasks
                    .iter()
                    .map(|task| task.name().to_owned())
                    .collect::<Vec<_>>();
                return Err(Error::Hung { hung_tasks });
            }
        }
    }

    result
}

/// A named [`JoinHandle`] which propagates panics when polled and is
/// `#[must_use]`, so every spawned task is either joined or explicitly
/// [`detach`](Task::detach)ed.
#[must_use]
pub struct Task<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

/// A [`Task`] whose completion is logged. Resolves to the task name.
pub struct LoggedTask<T>(Task<T>);

impl<T> Task<T> {
    /// Spawn a named task inside the current span.
    #[inline]
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self::spawn_with_span(name, tracing::Span::current(), future)
    }

    /// Spawn a named task inside a custom span. Use `parent: None` in the
    /// span macro to detach it from the current span.
    pub fn spawn_with_span<F>(
        name: impl Into<Cow<'static, str>>,
        span: tracing::Span,
        future: F,
    ) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        Self {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Let the task run in the background without a handle.
    #[inline]
    pub fn detach(self) {
        drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Log the task's outcome when it finishes.
    #[inline]
    pub fn logged(self) -> LoggedTask<T> {
        LoggedTask(self)
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        match result {
            Ok(value) => Poll::Ready(Ok(value)),
            Err(join_err) => match join_err.try_into_panic() {
                Ok(panic) => {
                    error!("Task '{}' panicked!", self.name);
                    std::panic::resume_unwind(panic)
                }
                Err(join_err) => Poll::Ready(Err(join_err)),
            },
        }
    }
}

impl<T> LoggedTask<T> {
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl<T> Future for LoggedTask<T> {
    type Output = Cow<'static, str>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            let outcome = Outcome {
                name: self.name(),
                result: result.as_ref().map(|_| ()),
            };
            match &outcome.result {
                Ok(()) => info!("{outcome}"),
                Err(_) => warn!("{outcome}"),
            }
            self.0.name.clone()
        })
    }
}

/// "Task '<name>' <finished|cancelled>[: <error>]"
struct Outcome<'a> {
    name: &'a str,
    result: Result<(), &'a JoinError>,
}

impl fmt::Display for Outcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name;
        match self.result {
            Ok(()) => write!(f, "Task '{name}' finished"),
            Err(e) if e.is_cancelled() => write!(f, "Task '{name}' cancelled"),
            Err(e) => write!(f, "Task '{name}' failed: {e:#}"),
        }
    }
}
