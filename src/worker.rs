//! Background workers: the periodic session sweep and the mail hand-off.

use crate::core::{RepoError, Result};
use crate::repository::Repository;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Periodically closes sessions idle for longer than the configured
/// session time.
pub struct SessionSweeper {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SessionSweeper {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| RepoError::Execution(format!("session sweeper join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the sweep loop on `handle`. Sweeps run on the blocking pool
/// since closing a session may wait for a connections set.
pub fn spawn_session_sweeper(
    handle: &Handle,
    repo: Arc<Repository>,
    interval: Duration,
) -> SessionSweeper {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let interval = interval.max(Duration::from_millis(10));

    let join_handle = handle.spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    let repo = Arc::clone(&repo);
                    match tokio::task::spawn_blocking(move || repo.clean_sessions()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(closed)) => info!(closed, "closed idle sessions"),
                        Ok(Err(err)) => error!(%err, "session sweep failed"),
                        Err(err) => error!(%err, "session sweep panicked"),
                    }
                }
            }
        }
        debug!("session sweeper stopped");
    });

    SessionSweeper {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    pub fn new<I, S>(recipients: I, subject: &str, body: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            recipients: recipients.into_iter().map(Into::into).collect(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

/// Actual mail delivery, provided by the application.
pub trait Mailer: Send + Sync + 'static {
    fn send(&self, message: &MailMessage) -> anyhow::Result<()>;
}

/// Sending side of the mail worker, held by the repository.
#[derive(Debug, Clone)]
pub struct MailQueue {
    tx: mpsc::UnboundedSender<MailMessage>,
}

impl MailQueue {
    pub fn send(&self, message: MailMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| RepoError::Execution("mail worker is stopped".into()))
    }
}

/// Delivers queued messages one at a time until every queue is dropped.
pub struct MailWorker {
    join_handle: Option<JoinHandle<usize>>,
}

impl MailWorker {
    /// Waits for the queue to drain; returns the number of delivered
    /// messages. Every `MailQueue` clone must be dropped first.
    pub async fn join(mut self) -> Result<usize> {
        match self.join_handle.take() {
            Some(join_handle) => join_handle
                .await
                .map_err(|err| RepoError::Execution(format!("mail worker join: {}", err))),
            None => Ok(0),
        }
    }
}

impl Drop for MailWorker {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub fn spawn_mail_worker(handle: &Handle, mailer: Arc<dyn Mailer>) -> (MailQueue, MailWorker) {
    let (tx, mut rx) = mpsc::unbounded_channel::<MailMessage>();

    let join_handle = handle.spawn(async move {
        let mut delivered = 0;
        while let Some(message) = rx.recv().await {
            let mailer = Arc::clone(&mailer);
            let subject = message.subject.clone();
            match tokio::task::spawn_blocking(move || mailer.send(&message)).await {
                Ok(Ok(())) => {
                    delivered += 1;
                    debug!(%subject, "mail delivered");
                }
                Ok(Err(err)) => error!(%subject, "mail delivery failed: {:#}", err),
                Err(err) => error!(%subject, %err, "mail delivery panicked"),
            }
        }
        delivered
    });

    (
        MailQueue { tx },
        MailWorker {
            join_handle: Some(join_handle),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<String>>,
    }

    impl Mailer for Outbox {
        fn send(&self, message: &MailMessage) -> anyhow::Result<()> {
            if message.recipients.is_empty() {
                anyhow::bail!("no recipient");
            }
            self.sent.lock().unwrap().push(message.subject.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mail_worker_delivers_in_order() {
        let outbox = Arc::new(Outbox::default());
        let (queue, worker) = spawn_mail_worker(&Handle::current(), outbox.clone());

        queue.send(MailMessage::new(["a@example.org"], "first", "")).unwrap();
        queue.send(MailMessage::new(Vec::<String>::new(), "rejected", "")).unwrap();
        queue.send(MailMessage::new(["b@example.org"], "second", "")).unwrap();
        drop(queue);

        assert_eq!(worker.join().await.unwrap(), 2);
        assert_eq!(*outbox.sent.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_queue_fails_once_worker_is_gone() {
        let outbox = Arc::new(Outbox::default());
        let (queue, worker) = spawn_mail_worker(&Handle::current(), outbox);
        drop(worker);
        tokio::task::yield_now().await;

        // the aborted task drops the receiver
        sleep(Duration::from_millis(20)).await;
        assert!(queue.send(MailMessage::new(["a@example.org"], "late", "")).is_err());
    }
}
