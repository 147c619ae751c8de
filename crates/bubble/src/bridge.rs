use crate::channel::CommandChannel;
use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{FailureValue, Init, Method, Reply, SessionHandle};
use crate::session::{SessionLifecycle, SessionState};

/// The engine session and the channel that speaks through it.
///
/// Every call except `init` first reads the live handle, so nothing reaches
/// the engine before initialization has succeeded or after the session was
/// released.
pub struct Bridge<E> {
    session: SessionLifecycle,
    channel: CommandChannel<E>,
}

impl<E: Engine> Bridge<E> {
    pub fn new(engine: E) -> Self {
        Self {
            session: SessionLifecycle::new(),
            channel: CommandChannel::new(engine),
        }
    }

    pub fn engine(&self) -> &E {
        self.channel.engine()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn handle(&self) -> BridgeResult<SessionHandle> {
        self.session.handle()
    }

    /// Create the engine session rooted at `data_dir`.
    ///
    /// Safe to call from several tasks at once; the engine sees one `init`.
    pub async fn init(&self, data_dir: impl Into<String>) -> BridgeResult<SessionHandle> {
        let args = Init {
            data_dir: data_dir.into(),
        };
        self.session
            .initialize(|| self.channel.call(None, &args))
            .await
    }

    /// Call `M` through the live session and return its tagged reply.
    pub async fn invoke<M: Method>(&self, args: &M) -> BridgeResult<Reply<M>> {
        let handle = self.session.handle()?;
        self.channel.call(Some(handle), args).await
    }

    /// Like [`Bridge::invoke`], with a failure value lifted into
    /// [`BridgeError::Domain`].
    pub async fn request<M: Method>(&self, args: &M) -> BridgeResult<M::Output> {
        self.invoke(args)
            .await?
            .map_err(|failure| BridgeError::Domain(failure.into_engine_error(M::NAME)))
    }

    /// Call a method by wire name with untyped arguments.
    ///
    /// `init` is refused here; the session is only created by [`Bridge::init`].
    pub async fn invoke_raw(
        &self,
        method: &str,
        args: &serde_json::Value,
    ) -> BridgeResult<Result<serde_json::Value, serde_json::Value>> {
        if method == Init::NAME {
            return Err(BridgeError::protocol(method, "use Bridge::init to create the session"));
        }
        let handle = self.session.handle()?;
        self.channel.call_raw(Some(handle), method, args).await
    }

    pub fn release(&self) -> BridgeResult<SessionHandle> {
        self.session.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GetStatus, Login};
    use crate::test_engine::ScriptedEngine;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn commands_before_init_never_reach_the_engine() {
        let bridge = Bridge::new(ScriptedEngine::new());
        let err = bridge.invoke(&GetStatus {}).await.unwrap_err();
        assert!(matches!(err, BridgeError::Uninitialized));
        let err = bridge
            .invoke_raw("get_groups", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Uninitialized));
        assert_eq!(bridge.engine().calls(), 0);
    }

    #[tokio::test]
    async fn init_then_status_uses_the_handle() {
        let bridge = Bridge::new(
            ScriptedEngine::new()
                .reply(r#"{"ok":true,"value":1}"#)
                .reply(r#"{"ok":true,"value":{"domain":"bubble.app","account_data":null}}"#),
        );
        assert_eq!(bridge.init("/data").await.unwrap(), SessionHandle(1));
        let status = bridge.request(&GetStatus {}).await.unwrap();
        assert_eq!(status.domain, "bubble.app");
        assert!(!status.is_authenticated());

        let sent = bridge.engine().envelopes();
        assert!(sent[0]["instance"].is_null());
        assert_eq!(sent[1]["instance"], 1);
    }

    #[tokio::test]
    async fn concurrent_init_issues_one_engine_call() {
        let engine = ScriptedEngine::with_delay(Duration::from_millis(20))
            .reply(r#"{"ok":true,"value":1}"#);
        let bridge = Arc::new(Bridge::new(engine));

        let (a, b, c) = tokio::join!(bridge.init("/data"), bridge.init("/data"), bridge.init("/other"));
        assert_eq!(a.unwrap(), SessionHandle(1));
        assert_eq!(b.unwrap(), SessionHandle(1));
        assert_eq!(c.unwrap(), SessionHandle(1));
        assert_eq!(bridge.engine().calls(), 1);
    }

    #[tokio::test]
    async fn domain_failure_keeps_session_ready() {
        let bridge = Bridge::new(
            ScriptedEngine::new()
                .reply(r#"{"ok":true,"value":1}"#)
                .reply(r#"{"ok":false,"value":"invalid credentials"}"#),
        );
        bridge.init("/data").await.unwrap();
        let err = bridge
            .request(&Login {
                username_or_email: "alice".into(),
                password: "wrong".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "invalid credentials");
        assert_eq!(bridge.state(), SessionState::Ready(SessionHandle(1)));
    }

    #[tokio::test]
    async fn void_failure_gets_a_message() {
        let bridge = Bridge::new(
            ScriptedEngine::new()
                .reply(r#"{"ok":true,"value":1}"#)
                .reply(r#"{"ok":false,"value":null}"#),
        );
        bridge.init("/data").await.unwrap();
        let err = bridge.request(&GetStatus {}).await.unwrap_err();
        assert!(matches!(err, BridgeError::Domain(ref e) if e.message == "status failed"));
    }

    #[tokio::test]
    async fn raw_init_is_refused() {
        let bridge = Bridge::new(ScriptedEngine::new());
        let err = bridge
            .invoke_raw("init", &serde_json::json!({ "dataDir": "/data" }))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { .. }));
        assert_eq!(bridge.engine().calls(), 0);
    }

    #[tokio::test]
    async fn release_invalidates_later_calls() {
        let bridge = Bridge::new(ScriptedEngine::new().reply(r#"{"ok":true,"value":5}"#));
        bridge.init("/data").await.unwrap();
        bridge.release().unwrap();
        let err = bridge.invoke(&GetStatus {}).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidSession { handle } if handle == SessionHandle(5)));
        assert_eq!(bridge.engine().calls(), 1);
    }
}
