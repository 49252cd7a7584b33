use super::{ProcessingContext, Processor, ProcessorError};
use futures::lock::Mutex;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

/// State in which a processor currently resides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStatus {
    /// Processor has been handed to the scheduler but not yet started
    Startup,
    /// Processor is executing
    Running,
    /// Processor has exited cleanly
    Stopped,
    /// Processor has returned an error or panicked, it is not restarted
    Failed,
    /// Processor did not honor the shutdown request in time and has been aborted
    Terminated,
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

type StatusMap = Arc<Mutex<HashMap<String, ProcessorStatus>>>;

/// Runs processors in their own tasks and coordinates their shutdown
pub struct ProcessorScheduler {
    status: StatusMap,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    termination: watch::Sender<bool>,
    context: ProcessingContext,
}

impl Default for ProcessorScheduler {
    fn default() -> Self {
        let (termination, rx) = watch::channel(false);

        Self {
            status: Default::default(),
            handles: Default::default(),
            termination,
            context: ProcessingContext::new(rx),
        }
    }
}

impl ProcessorScheduler {
    /// Creates a scheduler without any processors
    pub fn new() -> Self {
        Self::default()
    }

    async fn change_status(status_map: &StatusMap, name: &str, status: ProcessorStatus) {
        info!("{:<16} {}", format!("{}", status), name);
        status_map.lock().await.insert(name.to_owned(), status);
    }

    async fn unique_name(&self, name: String) -> String {
        let status = self.status.lock().await;

        if !status.contains_key(&name) {
            return name;
        }

        (2..)
            .map(|n| format!("{}#{}", name, n))
            .find(|candidate| !status.contains_key(candidate))
            .unwrap_or(name)
    }

    /// Starts a processor in its own task and returns the name it is tracked under
    pub async fn spawn<P: Processor + 'static>(&self, processor: P) -> String {
        let name = self.unique_name(processor.name()).await;
        let status_map = self.status.clone();
        let ctx = self.context.clone();

        ProcessorScheduler::change_status(&status_map, &name, ProcessorStatus::Startup).await;

        let handle = {
            let name = name.clone();

            tokio::spawn(async move {
                ProcessorScheduler::change_status(&status_map, &name, ProcessorStatus::Running)
                    .await;

                let outcome = AssertUnwindSafe(processor.run(ctx)).catch_unwind().await;

                let status = match outcome {
                    Ok(Ok(())) | Ok(Err(ProcessorError::Stopping)) => ProcessorStatus::Stopped,
                    Ok(Err(ProcessorError::Failed(e))) => {
                        error!(processor = %name, error = ?e, "Processor failed");
                        ProcessorStatus::Failed
                    }
                    Err(_) => {
                        error!(processor = %name, "Processor panicked");
                        ProcessorStatus::Failed
                    }
                };

                ProcessorScheduler::change_status(&status_map, &name, status).await;
            })
        };

        self.handles.lock().await.push((name.clone(), handle));

        name
    }

    /// Current status of every processor spawned so far
    pub async fn status(&self) -> HashMap<String, ProcessorStatus> {
        self.status.lock().await.clone()
    }

    /// Requests all processors to stop and waits up to `grace` for them to do so
    ///
    /// Processors still running afterwards are aborted. Returns the final status of every processor.
    pub async fn shutdown(&self, grace: Duration) -> HashMap<String, ProcessorStatus> {
        self.termination.send(true).ok();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let deadline = Instant::now() + grace;

        for (name, mut handle) in handles {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("{} ignored graceful termination request", name);
                handle.abort();

                ProcessorScheduler::change_status(&self.status, &name, ProcessorStatus::Terminated)
                    .await;
            }
        }

        self.status().await
    }
}
