use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectError;
use crate::resource::ConnectionResource;

/// Future a transport returns from a connect call.
pub type ConnectFuture = BoxFuture<'static, ConnectOutcome>;

/// Outcome of one connection attempt.
pub type ConnectOutcome = Result<Arc<dyn ConnectionResource>, ConnectError>;

type SharedOutcome = Shared<BoxFuture<'static, ConnectOutcome>>;

/// One cancellable connection attempt.
///
/// Exactly one transport-level connection is opened per instance. The outcome
/// is a shared future: any number of callers may await [`result`](Self::result)
/// and all observe the same resource or error.
pub struct ConnectionProcess {
    name: String,
    token: CancellationToken,
    result: SharedOutcome,
    settled: AtomicBool,
}

impl ConnectionProcess {
    /// Drive `connect` on a background task, cancellable through
    /// [`abort`](Self::abort).
    pub fn spawn(name: String, connect: ConnectFuture) -> Self {
        let token = CancellationToken::new();
        let guard = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                // Dropping the connect future on cancellation closes any
                // half-open socket it held.
                () = guard.cancelled() => Err(ConnectError::aborted()),
                outcome = connect => outcome,
            }
        });

        let result = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ConnectError::unreachable(format!(
                    "connection task failed: {e}"
                ))),
            }
        }
        .boxed()
        .shared();

        Self {
            name,
            token,
            result,
            settled: AtomicBool::new(false),
        }
    }

    /// Diagnostic name, unique per attempt.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the in-flight attempt or, if it already connected, shut the
    /// resource down. Idempotent; never fails.
    pub fn abort(&self) {
        self.token.cancel();

        // The attempt may have completed between the caller's decision to
        // abort and the cancel above. Awaiting the shared outcome covers that
        // window: if a resource ever materializes, it gets shut down.
        let result = self.result.clone();
        drop(tokio::spawn(async move {
            if let Ok(resource) = result.await {
                resource.shutdown().await;
            }
        }));
    }

    /// Await the connection outcome.
    pub async fn result(&self) -> ConnectOutcome {
        self.result.clone().await
    }

    /// The connected resource, if the attempt already succeeded. Does not
    /// block; used for keep-alive probes.
    #[must_use]
    pub fn resource_if_connected(&self) -> Option<Arc<dyn ConnectionResource>> {
        self.result
            .peek()
            .and_then(|outcome| outcome.as_ref().ok())
            .map(Arc::clone)
    }

    /// Whether the attempt already completed with an error. A failed process
    /// is dead weight; callers replace it instead of joining it.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.result.peek().is_some_and(Result::is_err)
    }

    /// One-shot claim on applying the outcome's side effects. The outcome is
    /// observed both by callers and by a background task; whichever sees it
    /// first wins, everyone else backs off.
    pub(crate) fn claim_settlement(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProcess")
            .field("name", &self.name)
            .field("aborted", &self.token.is_cancelled())
            .field("connected", &self.resource_if_connected().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::Result;
    use crate::resource::{CloseFrame, OutgoingRequest, Response};

    #[derive(Debug, Default)]
    struct StubResource {
        shutdown: AtomicBool,
    }

    #[async_trait]
    impl ConnectionResource for StubResource {
        async fn send_request(&self, _request: OutgoingRequest) -> Result<Response> {
            Err(crate::Error::validation("not used in this test"))
        }

        async fn closed(&self) -> CloseFrame {
            std::future::pending().await
        }

        async fn shutdown(&self) {
            self.shutdown.store(true, Ordering::SeqCst);
        }

        fn force_keepalive(&self, _timeout_override: Option<Duration>) {}
    }

    #[tokio::test]
    async fn all_callers_observe_the_same_resource() {
        let resource: Arc<dyn ConnectionResource> = Arc::new(StubResource::default());
        let expected = Arc::clone(&resource);

        let process = ConnectionProcess::spawn(
            "authenticated:1".to_owned(),
            async move { Ok(resource) }.boxed(),
        );

        let (a, b) = tokio::join!(process.result(), process.result());
        let a = a.expect("first caller connects");
        let b = b.expect("second caller connects");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &expected));
    }

    #[tokio::test]
    async fn abort_before_completion_cancels_the_attempt() {
        let (_tx, rx) = oneshot::channel::<()>();
        let process = ConnectionProcess::spawn(
            "authenticated:2".to_owned(),
            async move {
                let _: std::result::Result<(), _> = rx.await;
                let resource: Arc<dyn ConnectionResource> = Arc::new(StubResource::default());
                Ok(resource)
            }
            .boxed(),
        );

        process.abort();
        process.abort(); // idempotent

        let outcome = process.result().await;
        assert!(outcome.expect_err("aborted").is_aborted());
    }

    #[tokio::test]
    async fn abort_after_completion_shuts_the_resource_down() {
        let resource = Arc::new(StubResource::default());
        let as_trait: Arc<dyn ConnectionResource> = Arc::clone(&resource) as _;

        let process = ConnectionProcess::spawn(
            "authenticated:3".to_owned(),
            async move { Ok(as_trait) }.boxed(),
        );

        let _: Arc<dyn ConnectionResource> = process.result().await.expect("connects");
        process.abort();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(resource.shutdown.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn settlement_goes_to_the_first_claimant_only() {
        let resource: Arc<dyn ConnectionResource> = Arc::new(StubResource::default());
        let process = ConnectionProcess::spawn(
            "authenticated:4".to_owned(),
            async move { Ok(resource) }.boxed(),
        );

        let _: Arc<dyn ConnectionResource> = process.result().await.expect("connects");

        assert!(process.claim_settlement());
        assert!(!process.claim_settlement());
    }

    #[tokio::test]
    async fn peek_sees_the_resource_only_after_completion() {
        let (tx, rx) = oneshot::channel::<()>();
        let process = ConnectionProcess::spawn(
            "unauthenticated:1".to_owned(),
            async move {
                let _: std::result::Result<(), _> = rx.await;
                let resource: Arc<dyn ConnectionResource> = Arc::new(StubResource::default());
                Ok(resource)
            }
            .boxed(),
        );

        assert!(process.resource_if_connected().is_none());

        tx.send(()).expect("receiver alive");
        let _: Arc<dyn ConnectionResource> = process.result().await.expect("connects");

        assert!(process.resource_if_connected().is_some());
    }
}
