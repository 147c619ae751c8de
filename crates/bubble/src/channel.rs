use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Envelope, Method, Reply, SessionHandle, decode_reply, lookup};

/// Typed calls over the engine's single entry point.
///
/// Each call encodes one envelope, invokes the engine exactly once and
/// decodes the tagged reply. Engine failures surface as
/// [`BridgeError::Transport`], undecodable replies as
/// [`BridgeError::Protocol`]; neither is folded into the reply's failure arm.
pub struct CommandChannel<E> {
    engine: E,
}

impl<E: Engine> CommandChannel<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub async fn call<M: Method>(
        &self,
        handle: Option<SessionHandle>,
        args: &M,
    ) -> BridgeResult<Reply<M>> {
        if M::REQUIRES_SESSION && handle.is_none() {
            return Err(BridgeError::Uninitialized);
        }
        let envelope = Envelope {
            instance: handle,
            method: M::NAME,
            args,
        }
        .to_json()?;
        let raw = self.dispatch(M::NAME, envelope).await?;
        decode_reply(M::NAME, &raw).inspect_err(|err| {
            tracing::warn!(method = M::NAME, %err, "undecodable engine reply");
        })
    }

    /// Call a method by name with untyped arguments.
    ///
    /// The name must be in the dispatch table and `args` must be a JSON
    /// object; both are checked before the engine is touched.
    pub async fn call_raw(
        &self,
        handle: Option<SessionHandle>,
        method: &str,
        args: &serde_json::Value,
    ) -> BridgeResult<Result<serde_json::Value, serde_json::Value>> {
        let spec = lookup(method).ok_or_else(|| BridgeError::protocol(method, "unknown method"))?;
        if spec.requires_session && handle.is_none() {
            return Err(BridgeError::Uninitialized);
        }
        if !args.is_object() {
            return Err(BridgeError::protocol(method, "args must be a JSON object"));
        }
        let envelope = Envelope {
            instance: handle,
            method: spec.name,
            args,
        }
        .to_json()?;
        let raw = self.dispatch(spec.name, envelope).await?;
        decode_reply(spec.name, &raw)
    }

    async fn dispatch(&self, method: &str, envelope: String) -> BridgeResult<String> {
        tracing::debug!(method, "engine call");
        self.engine.call(envelope).await.map_err(|err| {
            tracing::warn!(method, %err, "engine call failed");
            BridgeError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GetGroups, Init, Login, Uuid};
    use crate::test_engine::ScriptedEngine;

    #[tokio::test]
    async fn success_reply_is_decoded() {
        let channel = CommandChannel::new(ScriptedEngine::new().reply(r#"{"ok":true,"value":[]}"#));
        let groups = channel
            .call(Some(SessionHandle(1)), &GetGroups {})
            .await
            .unwrap()
            .unwrap();
        assert!(groups.is_empty());

        let sent = channel.engine().envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["instance"], 1);
        assert_eq!(sent[0]["method"], "get_groups");
    }

    #[tokio::test]
    async fn failure_reply_stays_a_value() {
        let channel = CommandChannel::new(
            ScriptedEngine::new().reply(r#"{"ok":false,"value":"invalid credentials"}"#),
        );
        let reply = channel
            .call(
                Some(SessionHandle(1)),
                &Login {
                    username_or_email: "alice".into(),
                    password: "wrong".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.unwrap_err().message, "invalid credentials");
    }

    #[tokio::test]
    async fn engine_failure_is_transport_error() {
        let channel = CommandChannel::new(ScriptedEngine::new().fail("engine crashed"));
        let err = channel
            .call(Some(SessionHandle(1)), &GetGroups {})
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Transport { .. }));
    }

    #[tokio::test]
    async fn garbage_reply_is_protocol_error() {
        let channel = CommandChannel::new(ScriptedEngine::new().reply("<html>"));
        let err = channel
            .call(Some(SessionHandle(1)), &GetGroups {})
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { .. }));
    }

    #[tokio::test]
    async fn session_methods_need_a_handle() {
        let channel = CommandChannel::new(ScriptedEngine::new());
        let err = channel.call(None, &GetGroups {}).await.unwrap_err();
        assert!(matches!(err, BridgeError::Uninitialized));
        assert_eq!(channel.engine().calls(), 0);
    }

    #[tokio::test]
    async fn init_runs_without_a_handle() {
        let channel = CommandChannel::new(ScriptedEngine::new().reply(r#"{"ok":true,"value":1}"#));
        let handle = channel
            .call(
                None,
                &Init {
                    data_dir: "/data".into(),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle, SessionHandle(1));
        assert_eq!(channel.engine().envelopes()[0]["args"]["dataDir"], "/data");
    }

    #[tokio::test]
    async fn raw_calls_are_validated_locally() {
        let channel = CommandChannel::new(ScriptedEngine::new());
        let err = channel
            .call_raw(Some(SessionHandle(1)), "drop_tables", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { .. }));

        let err = channel
            .call_raw(Some(SessionHandle(1)), "search", &serde_json::json!(["alice"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { .. }));

        let err = channel
            .call_raw(None, "search", &serde_json::json!({ "query": "al" }))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Uninitialized));
        assert_eq!(channel.engine().calls(), 0);
    }

    #[tokio::test]
    async fn raw_call_returns_untyped_reply() {
        let uuid = Uuid::new_v4();
        let reply = format!(r#"{{"ok":true,"value":"{uuid}"}}"#);
        let channel = CommandChannel::new(ScriptedEngine::new().reply(&reply));
        let value = channel
            .call_raw(Some(SessionHandle(3)), "create_group", &serde_json::json!({}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, serde_json::json!(uuid.to_string()));
    }
}
