//! Background consumer task
//!
//! [`Subscriber::spawn`](crate::Subscriber::spawn) moves a subscriber onto a
//! tokio task and returns a [`ConsumerHandle`], leaving the caller free to
//! publish or do other work while events are dispatched.

use tokio::task::JoinHandle;

use crate::connection::CloseHandle;
use crate::error::{Error, Result};

/// Owns a subscriber's background consume loop.
#[derive(Debug)]
pub struct ConsumerHandle {
    close: CloseHandle,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    pub(crate) fn new(close: CloseHandle, task: JoinHandle<Result<()>>) -> Self {
        Self { close, task }
    }

    /// Handle that stops the consume loop without consuming this one.
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// True once the consume loop has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the loop to stop, then wait for it.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down consumer");
        self.close.close();
        self.join().await
    }

    /// Wait for the loop to return on its own.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Worker(e.to_string())),
        }
    }
}
