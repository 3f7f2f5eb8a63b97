use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::app::error::AppError;
use crate::app::privilege::PrivilegeGateway;

type Job = Box<dyn FnOnce(&dyn PrivilegeGateway) + Send + 'static>;

/// Single worker that owns every privileged call.
///
/// Jobs run one at a time, in submission order, each right after a fresh
/// `elevate`. Callers await the reply without blocking their runtime thread.
pub struct RootExecutor {
    sender: mpsc::Sender<Job>,
}

impl RootExecutor {
    pub fn new(gateway: Arc<dyn PrivilegeGateway>) -> Result<Self, AppError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("root-executor".to_string())
            .spawn(move || {
                for job in receiver {
                    if catch_unwind(AssertUnwindSafe(|| job(gateway.as_ref()))).is_err() {
                        error!("privileged operation panicked");
                    }
                }
            })
            .map_err(|err| AppError::system(format!("Failed to start root executor: {err}"), ""))?;
        Ok(Self { sender })
    }

    /// Elevates, then runs `op` on the worker. Elevation failures come back as
    /// `ERR_PRIVILEGE` and `op` is skipped.
    pub async fn run<T, F>(&self, trace_id: &str, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PrivilegeGateway, &str) -> Result<T, AppError> + Send + 'static,
    {
        self.submit(trace_id, op).await
    }

    /// Queues `op` immediately; the returned future only waits for the reply.
    pub fn submit<T, F>(
        &self,
        trace_id: &str,
        op: F,
    ) -> impl Future<Output = Result<T, AppError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&dyn PrivilegeGateway, &str) -> Result<T, AppError> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let trace = trace_id.to_string();
        let job: Job = Box::new(move |gateway| {
            let result = match gateway.elevate(&trace) {
                Ok(()) => op(gateway, &trace),
                Err(err) => {
                    warn!(trace_id = %trace, error = %err, "root elevation failed");
                    Err(err)
                }
            };
            let _ = reply.send(result);
        });
        let queued = self
            .sender
            .send(job)
            .map_err(|_| AppError::system("Root executor is not running", trace_id));
        let trace = trace_id.to_string();
        async move {
            queued?;
            receiver
                .await
                .map_err(|_| AppError::system("Privileged operation aborted", trace))?
        }
    }
}
