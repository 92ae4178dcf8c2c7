/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{NotificationMessage, RequestId, RequestMessage, ResponseError, ResponseMessage, try_parse_message};

/// How long the proxy will wait for the IDE to answer a request it
/// originated itself (e.g. `window/workDoneProgress/create`).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ResponseMessage>>>>;

/// The server side of the connection to the IDE: reads Content-Length framed
/// JSON-RPC from stdin, writes responses and proxy-originated
/// requests/notifications to stdout.
pub struct IdeEndpoint {
    stdout: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicI64,
    requests_rx: Mutex<mpsc::UnboundedReceiver<RequestMessage>>,
    notifications_rx: Mutex<mpsc::UnboundedReceiver<NotificationMessage>>,
}

impl IdeEndpoint {
    /// Spawns the read loop over `stdin` and returns the endpoint handle used
    /// to write back to `stdout`.
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();

        tokio::spawn(reader_task(stdin, pending.clone(), req_tx, notif_tx));

        Self {
            stdout: Mutex::new(Box::new(stdout)),
            pending,
            next_id: AtomicI64::new(1),
            requests_rx: Mutex::new(req_rx),
            notifications_rx: Mutex::new(notif_rx),
        }
    }

    /// Takes the next request the IDE sent. Returns `None` once stdin closes.
    pub async fn next_request(&self) -> Option<RequestMessage> {
        self.requests_rx.lock().await.recv().await
    }

    /// Takes the next notification the IDE sent. Returns `None` once stdin
    /// closes.
    pub async fn next_notification(&self) -> Option<NotificationMessage> {
        self.notifications_rx.lock().await.recv().await
    }

    /// Sends a successful response to a request the IDE sent us.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    pub async fn respond_ok(&self, id: RequestId, result: Value) -> ProxyResult<()> {
        self.write_message(&ResponseMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        })
        .await
    }

    /// Sends an error response to a request the IDE sent us.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    pub async fn respond_err(&self, id: RequestId, code: i64, message: String) -> ProxyResult<()> {
        self.write_message(&ResponseMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(ResponseError {
                code,
                message,
                data: None,
            }),
        })
        .await
    }

    /// Sends a notification to the IDE (e.g. `textDocument/publishDiagnostics`,
    /// `$/progress`).
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> ProxyResult<()> {
        let message = NotificationMessage {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?,
        };
        self.write_message(&message).await
    }

    /// Sends a request the proxy itself originates against the IDE (e.g.
    /// `window/workDoneProgress/create`) and awaits its typed response.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolFailure` on timeout, disconnect, an error response,
    /// or a result that doesn't deserialize.
    pub async fn request<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> ProxyResult<R> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let message = RequestMessage {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?,
        };
        self.write_message(&message).await?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| ProxyError::ProtocolFailure(format!("{method} timed out")))?
            .map_err(|_| ProxyError::ProtocolFailure("IDE closed the connection".to_string()))?;

        if let Some(error) = response.error {
            return Err(ProxyError::ProtocolFailure(format!(
                "IDE returned {}: {}",
                error.code, error.message
            )));
        }

        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| ProxyError::ProtocolFailure(e.to_string()))
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> ProxyResult<()> {
        let body = serde_json::to_string(message).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;
        let framed = format!("Content-Length: {}\r\n\r\n{body}", body.len());
        let mut stdout = self.stdout.lock().await;
        stdout
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;
        stdout.flush().await.map_err(|e| ProxyError::ProtocolFailure(e.to_string()))
    }
}

async fn reader_task(
    mut stdin: impl AsyncRead + Unpin,
    pending: Pending,
    requests_tx: mpsc::UnboundedSender<RequestMessage>,
    notifications_tx: mpsc::UnboundedSender<NotificationMessage>,
) {
    let mut buffer = BytesMut::new();
    let mut chunk = [0_u8; 8192];

    loop {
        match stdin.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }

        loop {
            match try_parse_message(&mut buffer) {
                Ok(Some(body)) => dispatch(&body, &pending, &requests_tx, &notifications_tx).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("malformed message from IDE: {e}");
                    break;
                }
            }
        }
    }
}

async fn dispatch(
    body: &str,
    pending: &Pending,
    requests_tx: &mpsc::UnboundedSender<RequestMessage>,
    notifications_tx: &mpsc::UnboundedSender<NotificationMessage>,
) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        warn!("IDE sent invalid JSON");
        return;
    };

    let has_method = value.get("method").is_some();
    let has_id = value.get("id").is_some();

    if has_method && has_id {
        if let Ok(request) = serde_json::from_value::<RequestMessage>(value) {
            let _ = requests_tx.send(request);
        }
    } else if has_method {
        if let Ok(notification) = serde_json::from_value::<NotificationMessage>(value) {
            let _ = notifications_tx.send(notification);
        }
    } else if let Ok(response) = serde_json::from_value::<ResponseMessage>(value) {
        if let Some(id) = response.id.clone()
            && let Some(sender) = pending.lock().await.remove(&id)
        {
            let _ = sender.send(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn requests_from_the_ide_are_readable() {
        let (mut test_side, proxy_stdin) = duplex(4096);
        let (proxy_stdout, _test_stdout) = duplex(4096);
        let endpoint = IdeEndpoint::new(proxy_stdin, proxy_stdout);

        let body = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        test_side
            .write_all(format!("Content-Length: {}\r\n\r\n{body}", body.len()).as_bytes())
            .await
            .expect("write");

        let request = endpoint.next_request().await.expect("request");
        assert_eq!(request.method, "initialize");
        assert_eq!(request.id, RequestId::Number(1));
    }

    #[tokio::test]
    async fn responses_are_framed_with_content_length() {
        let (_test_side, proxy_stdin) = duplex(4096);
        let (proxy_stdout, mut test_stdout) = duplex(4096);
        let endpoint = IdeEndpoint::new(proxy_stdin, proxy_stdout);

        endpoint
            .respond_ok(RequestId::Number(7), serde_json::json!({"ok": true}))
            .await
            .expect("respond");

        let mut buf = [0_u8; 256];
        let n = test_stdout.read(&mut buf).await.expect("read");
        let written = String::from_utf8_lossy(&buf[..n]);
        assert!(written.starts_with("Content-Length: "));
        assert!(written.contains(r#""id":7"#));
    }

    #[tokio::test]
    async fn proxy_originated_requests_resolve_on_a_matching_response() {
        let (mut test_side, proxy_stdin) = duplex(4096);
        let (proxy_stdout, mut test_stdout) = duplex(4096);
        let endpoint = Arc::new(IdeEndpoint::new(proxy_stdin, proxy_stdout));

        let endpoint2 = endpoint.clone();
        let handle = tokio::spawn(async move {
            endpoint2
                .request::<_, Value>("window/workDoneProgress/create", serde_json::json!({"token": "t"}))
                .await
        });

        let mut buf = [0_u8; 512];
        let n = test_stdout.read(&mut buf).await.expect("read");
        let sent = String::from_utf8_lossy(&buf[..n]);
        assert!(sent.contains("workDoneProgress/create"));

        let reply = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        test_side
            .write_all(format!("Content-Length: {}\r\n\r\n{reply}", reply.len()).as_bytes())
            .await
            .expect("write");

        let result = handle.await.expect("join").expect("request");
        assert_eq!(result, Value::Null);
    }
}
