use std::{fmt::Display, future::Future, panic::AssertUnwindSafe};

use anyhow::{Result, anyhow};
use futures_util::FutureExt;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::warn;

/// How a role task finished.
#[derive(Debug)]
pub struct TaskExit<R> {
    pub role: R,
    pub result: Result<()>,
}

/// Runs role tasks and funnels their exits into one result channel so a
/// single coordinating loop decides what happens next.
pub struct Supervisor<R> {
    results_tx: mpsc::UnboundedSender<TaskExit<R>>,
    results_rx: mpsc::UnboundedReceiver<TaskExit<R>>,
    tasks: JoinSet<()>,
}

impl<R> Supervisor<R>
where
    R: Display + Copy + Send + 'static,
{
    pub fn new() -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            results_tx,
            results_rx,
            tasks: JoinSet::new(),
        }
    }

    pub fn launch<F>(&mut self, role: R, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let results = self.results_tx.clone();
        self.tasks.spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("{role} task panicked")),
            };
            let _ = results.send(TaskExit { role, result });
        });
    }

    /// Waits for the next role to finish.
    pub async fn next_exit(&mut self) -> Option<TaskExit<R>> {
        self.results_rx.recv().await
    }

    /// Waits for every launched task. Call after signalling shutdown.
    pub async fn drain(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = ?err, "role task did not finish cleanly");
            }
        }
    }
}

impl<R> Default for Supervisor<R>
where
    R: Display + Copy + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
