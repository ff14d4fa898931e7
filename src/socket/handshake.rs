//! Handshake handlers installed on a channel during establishment.

use crate::base::neterror::NetError;
use crate::future::{Context, Deferred};
use crate::socket::transport::Address;
use std::future::{Future, IntoFuture};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Terminal success signal of a handshake stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    ProxyConnected { destination: Address },
    TlsCompleted { application_protocol: Option<String> },
}

/// One handshake stage driven over a channel of type `C`.
///
/// `handshake` returns a result that settles exactly once with the
/// definitive outcome; transport noise in between is not reported.
pub trait HandshakeHandler<C>: Send + Sync {
    /// Name under which the handler sits in the channel's chain.
    fn name(&self) -> &'static str;

    fn handshake(&self, context: &Context, channel: &C) -> Deferred<HandshakeEvent>;
}

/// Single-assignment completion for handlers that race several signal
/// sources (the handshake itself, a timer). The first signal wins; later
/// ones are dropped at trace level.
#[derive(Clone)]
pub struct HandshakeCompletion {
    stage: &'static str,
    result: Deferred<HandshakeEvent>,
}

impl HandshakeCompletion {
    pub fn new(context: &Context, stage: &'static str) -> Self {
        Self {
            stage,
            result: Deferred::new(context),
        }
    }

    pub fn succeed(&self, event: HandshakeEvent) -> bool {
        let won = self.result.complete(event);
        if !won {
            tracing::trace!(stage = self.stage, "late handshake success ignored");
        }
        won
    }

    pub fn fail(&self, error: NetError) -> bool {
        let won = self.result.fail(error);
        if !won {
            tracing::trace!(stage = self.stage, "late handshake failure ignored");
        }
        won
    }

    /// Run `work` on the current tokio runtime and settle with its outcome.
    ///
    /// If `work` has not finished within `timeout` it is dropped, releasing
    /// any socket it holds, and the completion fails with
    /// [`NetError::ConnectionTimedOut`].
    pub fn drive<F>(&self, timeout: Duration, work: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<HandshakeEvent, NetError>> + Send + 'static,
    {
        let completion = self.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, work).await {
                Ok(Ok(event)) => completion.succeed(event),
                Ok(Err(e)) => completion.fail(e),
                Err(_) => {
                    tracing::debug!(stage = completion.stage, ?timeout, "handshake timed out");
                    completion.fail(NetError::ConnectionTimedOut)
                }
            };
        })
    }

    /// Fail with [`NetError::ConnectionTimedOut`] unless settled within
    /// `timeout`, for handlers signalled from outside a single future. The
    /// timer task ends as soon as the completion settles.
    pub fn arm_timeout(&self, timeout: Duration) -> JoinHandle<()> {
        let completion = self.clone();
        let settled = self.result.clone().into_future();
        tokio::spawn(async move {
            tokio::select! {
                _ = settled => {}
                _ = tokio::time::sleep(timeout) => {
                    if completion.fail(NetError::ConnectionTimedOut) {
                        tracing::debug!(stage = completion.stage, ?timeout, "handshake timed out");
                    }
                }
            }
        })
    }

    pub fn result(&self) -> Deferred<HandshakeEvent> {
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_wins() {
        let ctx = Context::serial();
        let completion = HandshakeCompletion::new(&ctx, "tls");
        assert!(completion.succeed(HandshakeEvent::TlsCompleted {
            application_protocol: Some("h2".into())
        }));
        assert!(!completion.fail(NetError::ConnectionTimedOut));
        assert!(matches!(
            completion.result().outcome(),
            Some(Ok(HandshakeEvent::TlsCompleted { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_when_silent() {
        let ctx = Context::serial();
        let completion = HandshakeCompletion::new(&ctx, "proxy");
        completion.arm_timeout(Duration::from_millis(50));
        let outcome = completion.result().await;
        assert!(matches!(outcome, Err(NetError::ConnectionTimedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ends_when_settled() {
        let ctx = Context::serial();
        let completion = HandshakeCompletion::new(&ctx, "proxy");
        let timer = completion.arm_timeout(Duration::from_secs(10));
        completion.succeed(HandshakeEvent::TlsCompleted {
            application_protocol: None,
        });

        // The paused clock would jump straight to the 10s deadline if the
        // timer were still sleeping.
        tokio::time::timeout(Duration::from_millis(1), timer)
            .await
            .expect("timer released on settle")
            .unwrap();
        assert!(matches!(completion.result().outcome(), Some(Ok(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_drops_work_on_timeout() {
        struct Guard(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let guard = Guard(dropped.clone());
        let ctx = Context::serial();
        let completion = HandshakeCompletion::new(&ctx, "socks5");
        let task = completion.drive(Duration::from_millis(50), async move {
            let _guard = guard;
            std::future::pending::<Result<HandshakeEvent, NetError>>().await
        });

        assert!(matches!(completion.result().await, Err(NetError::ConnectionTimedOut)));
        task.await.unwrap();
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drive_reports_work_outcome() {
        let ctx = Context::serial();
        let completion = HandshakeCompletion::new(&ctx, "http");
        completion.drive(Duration::from_secs(5), async {
            Err(NetError::ProxyAuthRequested)
        });
        assert!(matches!(completion.result().await, Err(NetError::ProxyAuthRequested)));
    }
}
