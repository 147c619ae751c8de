use crate::error::{BridgeError, BridgeResult};
use crate::protocol::SessionHandle;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::OnceCell;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready(SessionHandle),
    Failed(String),
    Released(SessionHandle),
}

/// Owner of the engine session handle.
///
/// Initialization runs at most once: callers that arrive while an attempt is
/// in flight wait for it instead of starting another, and callers that
/// arrive afterwards get the stored outcome. A failed attempt is terminal.
#[derive(Debug, Default)]
pub struct SessionLifecycle {
    outcome: OnceCell<Result<SessionHandle, InitFailure>>,
    in_flight: AtomicUsize,
    released: AtomicBool,
}

#[derive(Debug, Clone)]
struct InitFailure {
    message: String,
    /// The init call never produced a reply.
    channel: bool,
}

impl InitFailure {
    fn to_error(&self) -> BridgeError {
        BridgeError::InitFailed {
            message: self.message.clone(),
            channel: self.channel,
        }
    }
}

/// Counts an initialization attempt for as long as its future is alive.
struct Attempt<'a>(&'a AtomicUsize);

impl<'a> Attempt<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SessionLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        match self.outcome.get() {
            Some(Ok(handle)) if self.released.load(Ordering::Acquire) => {
                SessionState::Released(*handle)
            }
            Some(Ok(handle)) => SessionState::Ready(*handle),
            Some(Err(failure)) => SessionState::Failed(failure.message.clone()),
            None if self.in_flight.load(Ordering::Acquire) > 0 => SessionState::Initializing,
            None => SessionState::Uninitialized,
        }
    }

    /// The live handle. Any state but `Ready` is a local error; a failed
    /// session reads as `Uninitialized` here, the failure itself is
    /// reported by [`initialize`].
    ///
    /// [`initialize`]: SessionLifecycle::initialize
    pub fn handle(&self) -> BridgeResult<SessionHandle> {
        match self.state() {
            SessionState::Ready(handle) => Ok(handle),
            SessionState::Released(handle) => Err(BridgeError::InvalidSession { handle }),
            SessionState::Uninitialized | SessionState::Initializing | SessionState::Failed(_) => {
                Err(BridgeError::Uninitialized)
            }
        }
    }

    /// Run `init` unless an attempt already ran or is running.
    ///
    /// `init` resolves to the engine's tagged reply; both a failure value and
    /// a channel error leave the session `Failed`.
    pub async fn initialize<F, Fut>(&self, init: F) -> BridgeResult<SessionHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BridgeResult<Result<SessionHandle, String>>>,
    {
        let outcome = self
            .outcome
            .get_or_init(|| async move {
                let _attempt = Attempt::enter(&self.in_flight);
                match init().await {
                    Ok(Ok(handle)) => {
                        tracing::info!(%handle, "engine session ready");
                        Ok(handle)
                    }
                    Ok(Err(message)) => {
                        tracing::warn!(%message, "engine refused to initialize");
                        Err(InitFailure {
                            message,
                            channel: false,
                        })
                    }
                    Err(err) => {
                        tracing::warn!(%err, "engine initialization failed");
                        Err(InitFailure {
                            message: err.to_string(),
                            channel: err.is_channel_failure(),
                        })
                    }
                }
            })
            .await;
        match outcome {
            Ok(_) => self.handle(),
            Err(failure) => Err(failure.to_error()),
        }
    }

    /// Invalidate the handle. Every later use fails with `InvalidSession`.
    pub fn release(&self) -> BridgeResult<SessionHandle> {
        let handle = self.handle()?;
        self.released.store(true, Ordering::Release);
        tracing::info!(%handle, "engine session released");
        Ok(handle)
    }
}
