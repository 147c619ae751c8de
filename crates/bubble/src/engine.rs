use crate::error::TransportError;
use crate::protocol::MAX_LINE_BYTES;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// The single entry point of the embedded engine.
///
/// Takes one serialized envelope and resolves to one serialized reply.
/// Implementations move bytes only; encoding and decoding belong to
/// [`crate::channel::CommandChannel`].
pub trait Engine: Send + Sync + 'static {
    fn call(&self, envelope: String) -> impl Future<Output = Result<String, TransportError>> + Send;
}

impl<E: Engine> Engine for std::sync::Arc<E> {
    fn call(&self, envelope: String) -> impl Future<Output = Result<String, TransportError>> + Send {
        (**self).call(envelope)
    }
}

struct Connection {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
}

impl Connection {
    async fn open(socket_path: &Path) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|err| {
            TransportError::new(format!(
                "failed to connect to {}: {err}",
                socket_path.display()
            ))
        })?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        })
    }

    async fn round_trip(&mut self, envelope: String) -> Result<String, TransportError> {
        self.writer
            .send(envelope)
            .await
            .map_err(|err| TransportError::new(format!("socket write failed: {err}")))?;
        match self.reader.next().await {
            Some(Ok(line)) => Ok(line),
            Some(Err(err)) => Err(TransportError::new(format!("socket read failed: {err}"))),
            None => Err(TransportError::new("engine host disconnected")),
        }
    }
}

/// Engine reached through an engine host's Unix socket, one JSON line per
/// envelope and one JSON line per reply.
///
/// The connection is opened on first use. One call is in flight at a time;
/// a failed call drops the connection and the next call reconnects.
pub struct SocketEngine {
    socket_path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SocketEngine {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            conn: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Engine for SocketEngine {
    async fn call(&self, envelope: String) -> Result<String, TransportError> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => {
                let conn = Connection::open(&self.socket_path).await?;
                tracing::debug!(socket = %self.socket_path.display(), "connected to engine host");
                conn
            }
        };
        let result = conn.round_trip(envelope).await;
        if result.is_ok() {
            *guard = Some(conn);
        }
        result
    }
}

/// Discover the default engine socket path.
///
/// Checks `$BUBBLE_SOCKET`, then falls back to
/// `$XDG_RUNTIME_DIR/bubble/engine.sock` or `/tmp/bubble-$UID/engine.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("BUBBLE_SOCKET") {
        return PathBuf::from(p);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("bubble").join("engine.sock");
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/bubble-{uid}/engine.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Serve `replies` in order, one per received line, then hang up.
    async fn serve(listener: UnixListener, replies: Vec<&'static str>) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, w) = stream.into_split();
        let mut reader = FramedRead::new(r, LinesCodec::new());
        let mut writer = FramedWrite::new(w, LinesCodec::new());
        let mut seen = Vec::new();
        for reply in replies {
            let Some(Ok(line)) = reader.next().await else {
                break;
            };
            seen.push(line);
            writer.send(reply).await.unwrap();
        }
        seen
    }

    #[tokio::test]
    async fn round_trips_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve(listener, vec![r#"{"ok":true,"value":1}"#, r#"{"ok":true}"#]));

        let engine = SocketEngine::new(&path);
        let first = engine.call(r#"{"method":"init"}"#.to_string()).await.unwrap();
        assert_eq!(first, r#"{"ok":true,"value":1}"#);
        let second = engine.call(r#"{"method":"logout"}"#.to_string()).await.unwrap();
        assert_eq!(second, r#"{"ok":true}"#);

        let seen = server.await.unwrap();
        assert_eq!(seen, vec![r#"{"method":"init"}"#, r#"{"method":"logout"}"#]);
    }

    #[tokio::test]
    async fn missing_socket_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SocketEngine::new(dir.path().join("absent.sock"));
        let err = engine.call("{}".to_string()).await.unwrap_err();
        assert!(err.message.contains("failed to connect"));
    }

    #[tokio::test]
    async fn hangup_drops_connection_and_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            // First connection: read one line and hang up without replying.
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = FramedRead::new(stream, LinesCodec::new());
            let _ = reader.next().await;
            drop(reader);
            serve(listener, vec![r#"{"ok":true,"value":true}"#]).await
        });

        let engine = SocketEngine::new(&path);
        let err = engine.call("{}".to_string()).await.unwrap_err();
        assert!(err.message.contains("disconnected") || err.message.contains("failed"));

        let reply = engine.call("{}".to_string()).await.unwrap();
        assert_eq!(reply, r#"{"ok":true,"value":true}"#);
        server.await.unwrap();
    }
}
