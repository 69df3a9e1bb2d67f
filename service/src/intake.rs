//! Intake service: validate, persist, launch, acknowledge.

use crate::lifecycle::{LifecycleInput, RequestLifecycle};
use settlement_core::environment::Clock;
use settlement_core::request::IllegalTransition;
use settlement_core::{
    Amount, LaunchError, LaunchOptions, ProcessLauncher, Request, RequestId, RequestKind,
    RequestStatus, RequestStore, RunId, StoreError, ValidationError,
};
use settlement_runtime::Process;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to intake callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    /// The request is malformed; nothing was stored.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The request store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The lifecycle could not be launched; the pending record is kept.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The lifecycle input could not be encoded.
    #[error("failed to encode lifecycle input: {0}")]
    Input(String),

    /// The stored request was bound to a different run.
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

/// Acknowledgment returned once the lifecycle is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Identity of the new request.
    pub request_id: RequestId,
    /// Run bound to the request.
    pub run_id: RunId,
}

/// Accepts mint and redeem requests and launches their lifecycle.
///
/// Returns as soon as the run is launched and bound to the request; the
/// terminal status is observed later through the request store. A worker
/// may finish the run before intake records it, in which case the run has
/// already bound itself and intake's write is skipped.
#[derive(Clone)]
pub struct IntakeService {
    store: Arc<dyn RequestStore>,
    launcher: Result<Arc<dyn ProcessLauncher>, LaunchError>,
    clock: Arc<dyn Clock>,
    task_queue: String,
    process_timeout: Duration,
}

impl IntakeService {
    /// Create the service.
    ///
    /// `launcher` is the launch client built at startup, or the error
    /// that prevented building it.
    #[must_use]
    pub fn new(
        store: Arc<dyn RequestStore>,
        launcher: Result<Arc<dyn ProcessLauncher>, LaunchError>,
        clock: Arc<dyn Clock>,
        task_queue: impl Into<String>,
        process_timeout: Duration,
    ) -> Self {
        Self {
            store,
            launcher,
            clock,
            task_queue: task_queue.into(),
            process_timeout,
        }
    }

    /// Submit a request.
    ///
    /// # Errors
    ///
    /// - `Validation`: amount not positive or recipient blank; nothing stored
    /// - `Store`: the pending record or the `started` update could not be written
    /// - `Launch`: the launch client is unavailable or the launch failed;
    ///   the pending record is kept
    /// - `Transition`: the request was bound to a run other than the launched one
    #[tracing::instrument(skip(self, recipient), fields(kind = kind.as_str()))]
    pub async fn submit(
        &self,
        kind: RequestKind,
        amount: f64,
        recipient: &str,
    ) -> Result<Submission, IntakeError> {
        let amount = Amount::from_decimal(amount)
            .inspect_err(|e| tracing::debug!(reason = e.detail(), "Rejected request"))?;
        let mut request = Request::new(kind, amount, recipient, self.clock.now())
            .inspect_err(|e| tracing::debug!(reason = e.detail(), "Rejected request"))?;
        let request_id = request.id;

        self.store.create(request.clone()).await?;
        tracing::debug!(%request_id, "Pending request stored");

        let launcher = self.launcher.as_ref().map_err(|e| {
            tracing::error!(%request_id, error = %e, "No launch client available");
            e.clone()
        })?;

        let input = serde_json::to_value(LifecycleInput {
            kind,
            amount,
            recipient: request.recipient.clone(),
            request_id,
        })
        .map_err(|e| IntakeError::Input(e.to_string()))?;
        let options = LaunchOptions::new(request_id.to_string(), self.task_queue.as_str())
            .with_start_to_close_timeout(self.process_timeout);

        let run_id = launcher
            .launch(RequestLifecycle::NAME, input, options)
            .await
            .inspect_err(|e| {
                tracing::error!(%request_id, error = %e, "Failed to launch lifecycle");
            })?;

        request.mark_started(run_id.clone())?;
        self.bind(request, &run_id).await?;

        tracing::info!(%request_id, %run_id, "Request submitted");
        metrics::counter!("requests.submitted", "kind" => kind.as_str()).increment(1);

        Ok(Submission { request_id, run_id })
    }

    async fn bind(&self, request: Request, run_id: &RunId) -> Result<(), IntakeError> {
        let request_id = request.id;
        match self.store.save_if(request, RequestStatus::Pending).await {
            Ok(()) => Ok(()),
            Err(StoreError::ConcurrencyConflict { .. }) => {
                let stored = self.store.find_by_id(request_id).await?;
                if stored.run_id.as_ref() != Some(run_id) {
                    return Err(IllegalTransition {
                        from: stored.status,
                        to: RequestStatus::Started,
                    }
                    .into());
                }
                tracing::debug!(
                    %request_id,
                    status = stored.status.as_str(),
                    "Run bound itself before intake"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use settlement_testing::{FailingLauncher, InMemoryRequestStore, RecordingLauncher, test_clock};
    use std::future::Future;
    use std::pin::Pin;

    /// Launcher whose run finishes before `launch` returns.
    struct FinishingLauncher {
        store: InMemoryRequestStore,
        run_id: &'static str,
    }

    impl ProcessLauncher for FinishingLauncher {
        fn launch(
            &self,
            _process_type: &str,
            input: serde_json::Value,
            _options: LaunchOptions,
        ) -> Pin<Box<dyn Future<Output = Result<RunId, LaunchError>> + Send + '_>> {
            Box::pin(async move {
                let input: LifecycleInput = serde_json::from_value(input).unwrap();
                let mut request = self.store.get(input.request_id).unwrap();
                request.mark_started(RunId::new(self.run_id)).unwrap();
                request.transition_to(RequestStatus::Completed).unwrap();
                self.store.save(request).await.unwrap();
                Ok(RunId::new("run-1"))
            })
        }
    }

    fn intake(
        store: &InMemoryRequestStore,
        launcher: Result<Arc<dyn ProcessLauncher>, LaunchError>,
    ) -> IntakeService {
        IntakeService::new(
            Arc::new(store.clone()),
            launcher,
            Arc::new(test_clock()),
            "mint-redeem",
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn submit_stores_started_request_bound_to_run() {
        let store = InMemoryRequestStore::new();
        let launcher = RecordingLauncher::new();
        let intake = intake(&store, Ok(Arc::new(launcher.clone())));

        let submission = intake.submit(RequestKind::Mint, 10.50, "0xnotdeadbeef").await.unwrap();

        let stored = store.get(submission.request_id).unwrap();
        assert_eq!(stored.status, RequestStatus::Started);
        assert_eq!(stored.run_id, Some(submission.run_id.clone()));
        assert_eq!(stored.amount.to_string(), "10.50");
        assert_eq!(stored.created_at, test_clock().now());

        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].process_type, RequestLifecycle::NAME);
        assert_eq!(launches[0].options.id, submission.request_id.to_string());
        assert_eq!(launches[0].options.task_queue, "mint-redeem");
        assert_eq!(
            launches[0].options.start_to_close_timeout,
            Duration::from_secs(300)
        );
        let input: LifecycleInput = serde_json::from_value(launches[0].input.clone()).unwrap();
        assert_eq!(input.request_id, submission.request_id);
        assert_eq!(input.recipient, "0xnotdeadbeef");
    }

    #[tokio::test]
    async fn invalid_input_creates_no_record() {
        let store = InMemoryRequestStore::new();
        let launcher = RecordingLauncher::new();
        let intake = intake(&store, Ok(Arc::new(launcher.clone())));

        for (amount, recipient) in [(0.0, "0xabc"), (-5.0, "0xabc"), (10.5, ""), (10.5, "  ")] {
            let err = intake.submit(RequestKind::Mint, amount, recipient).await.unwrap_err();
            assert!(matches!(err, IntakeError::Validation(_)));
            assert_eq!(err.to_string(), "Invalid request payload");
        }

        assert!(store.is_empty());
        assert!(launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn launch_failure_keeps_pending_record() {
        let store = InMemoryRequestStore::new();
        let failing = FailingLauncher::new(LaunchError::UnknownTaskQueue("mint-redeem".into()));
        let intake = intake(&store, Ok(Arc::new(failing)));

        let err = intake.submit(RequestKind::Redeem, 1.0, "0xabc").await.unwrap_err();

        assert!(matches!(err, IntakeError::Launch(_)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.save_count(), 0);
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn missing_launch_client_keeps_pending_record() {
        let store = InMemoryRequestStore::new();
        let intake = intake(
            &store,
            Err(LaunchError::ClientConstruction("no engine serves task queue".into())),
        );

        let err = intake.submit(RequestKind::Mint, 1.0, "0xabc").await.unwrap_err();

        assert!(matches!(err, IntakeError::Launch(LaunchError::ClientConstruction(_))));
        assert_eq!(store.len(), 1);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn run_that_bound_itself_first_is_accepted() {
        let store = InMemoryRequestStore::new();
        let launcher = FinishingLauncher {
            store: store.clone(),
            run_id: "run-1",
        };
        let intake = intake(&store, Ok(Arc::new(launcher)));

        let submission = intake.submit(RequestKind::Mint, 10.50, "0xabc").await.unwrap();

        let stored = store.get(submission.request_id).unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
        assert_eq!(stored.run_id, Some(RunId::new("run-1")));
        assert_eq!(submission.run_id, RunId::new("run-1"));
    }

    #[tokio::test]
    async fn request_bound_to_another_run_is_refused() {
        let store = InMemoryRequestStore::new();
        let launcher = FinishingLauncher {
            store: store.clone(),
            run_id: "run-0",
        };
        let intake = intake(&store, Ok(Arc::new(launcher)));

        let err = intake.submit(RequestKind::Mint, 10.50, "0xabc").await.unwrap_err();

        assert_eq!(
            err,
            IntakeError::Transition(IllegalTransition {
                from: RequestStatus::Completed,
                to: RequestStatus::Started,
            })
        );
    }
}
