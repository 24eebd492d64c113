//! Task helpers used in [`portmap`][`crate`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tracing::trace;

/// A join handle that owns the task it is running, and aborts it when dropped.
#[derive(Debug)]
pub(crate) struct AbortOnDropHandle<T>(tokio::task::JoinHandle<T>);

impl<T> From<tokio::task::JoinHandle<T>> for AbortOnDropHandle<T> {
    fn from(handle: tokio::task::JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Future for AbortOnDropHandle<T> {
    type Output = Result<T, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Aborts a task on drop without owning its output.
///
/// Used to tie a background task to a handle held by client code: when the
/// last clone of the handle goes away, so does the task.
#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    task_name: &'static str,
    handle: tokio::task::AbortHandle,
}

impl CancelOnDrop {
    pub(crate) fn new(task_name: &'static str, handle: tokio::task::AbortHandle) -> Self {
        CancelOnDrop { task_name, handle }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.handle.abort();
        trace!("{} dropped, aborting task", self.task_name);
    }
}
