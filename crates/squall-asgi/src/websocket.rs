//! The websocket protocol adapter.
//!
//! [`AsgiWebsocketConnection`] bridges a bidirectional event stream to a
//! queue-backed [`Websocket`]. The accept handshake is lazy and
//! idempotent; close is loud on reuse. A handler that returns a response
//! without accepting gets it streamed over the `websocket.http.response`
//! extension when the transport offers it, and an immediate close with
//! code 1000 otherwise.

use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use squall_core::App;
use squall_http::{
    HeaderMap, RequestHead, Response, Websocket, WebsocketError, WsAcceptFn, WsCloseFn, WsSendFn,
};
use tokio::sync::mpsc;

use crate::events::{SendFn, WebsocketScope, WsRecvEvent, WsSendEvent, parse_spec_version};
use crate::http::{diagnostic_response, race_to_completion};

/// Inbound message queue depth between the receiver loop and the
/// handler.
const QUEUE_DEPTH: usize = 32;

#[derive(Default)]
struct SharedState {
    accepted: bool,
    closed: bool,
}

/// Bridges one websocket connection between the transport and the app.
pub struct AsgiWebsocketConnection {
    app: Arc<App>,
    scope: WebsocketScope,
}

impl AsgiWebsocketConnection {
    pub fn new(app: Arc<App>, scope: WebsocketScope) -> Self {
        Self { app, scope }
    }

    pub async fn run(
        self,
        receive: mpsc::Receiver<WsRecvEvent>,
        send: SendFn<WsSendEvent>,
    ) -> anyhow::Result<()> {
        let state = Arc::new(StdMutex::new(SharedState::default()));
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let websocket = self.build_websocket(queue_rx, &send, &state);

        let mut receiver_task = tokio::spawn(receive_messages(receive, queue_tx));

        let app = self.app.clone();
        let extensions = self.scope.extensions.clone();
        let handler_send = send.clone();
        let handler_state = state.clone();
        let mut handler_task = tokio::spawn(async move {
            handle_websocket(app, websocket, handler_send, handler_state, extensions).await
        });

        race_to_completion(&mut receiver_task, &mut handler_task).await
    }

    fn build_websocket(
        &self,
        queue: mpsc::Receiver<squall_http::WsMessage>,
        send: &SendFn<WsSendEvent>,
        state: &Arc<StdMutex<SharedState>>,
    ) -> Websocket {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Remote-Addr",
            self.scope
                .client
                .clone()
                .unwrap_or_else(|| "<local>".to_string()),
        );
        headers.extend(&HeaderMap::from_byte_pairs(&self.scope.headers));

        let head = RequestHead {
            method: "GET".to_string(),
            scheme: self.scope.scheme.clone(),
            path: crate::http::normalize_path(&self.scope.path, &self.scope.root_path),
            query_string: self.scope.query_string.clone(),
            headers,
            root_path: self.scope.root_path.clone(),
            http_version: self.scope.http_version.clone(),
            routing: None,
        };

        let version = parse_spec_version(&self.scope.spec_version);

        let send_fn: WsSendFn = {
            let send = send.clone();
            Arc::new(move |message| {
                let send = send.clone();
                Box::pin(async move {
                    send(WsSendEvent::Message(message))
                        .await
                        .map_err(|err| WebsocketError::Transport(err.to_string()))
                })
            })
        };

        let accept_fn: WsAcceptFn = {
            let send = send.clone();
            let state = state.clone();
            let version = version.clone();
            Arc::new(move |headers, subprotocol| {
                let send = send.clone();
                let state = state.clone();
                let version = version.clone();
                Box::pin(async move {
                    {
                        let mut state = state.lock().expect("ws state lock");
                        if state.accepted {
                            return Ok(());
                        }
                        state.accepted = true;
                    }
                    let header_pairs = if version > parse_spec_version("2.0") {
                        headers.encode()
                    } else {
                        if !headers.is_empty() {
                            tracing::warn!(
                                "transport does not support accept headers, headers not sent"
                            );
                        }
                        Vec::new()
                    };
                    send(WsSendEvent::Accept {
                        subprotocol,
                        headers: header_pairs,
                    })
                    .await
                    .map_err(|err| WebsocketError::Transport(err.to_string()))
                })
            })
        };

        let close_fn: WsCloseFn = {
            let send = send.clone();
            let state = state.clone();
            Arc::new(move |code, reason| {
                let send = send.clone();
                let state = state.clone();
                let version = version.clone();
                Box::pin(async move {
                    {
                        let mut state = state.lock().expect("ws state lock");
                        if state.closed {
                            return Err(WebsocketError::AlreadyClosed);
                        }
                        state.closed = true;
                    }
                    // Close reasons only exist from protocol 2.3 on.
                    let reason = if version >= parse_spec_version("2.3") {
                        Some(reason)
                    } else {
                        None
                    };
                    send(WsSendEvent::Close { code, reason })
                        .await
                        .map_err(|err| WebsocketError::Transport(err.to_string()))
                })
            })
        };

        Websocket::new(
            head,
            self.scope.subprotocols.clone(),
            queue,
            send_fn,
            accept_fn,
            close_fn,
        )
    }
}

async fn receive_messages(
    mut receive: mpsc::Receiver<WsRecvEvent>,
    queue: mpsc::Sender<squall_http::WsMessage>,
) {
    while let Some(event) = receive.recv().await {
        match event {
            WsRecvEvent::Connect => {}
            WsRecvEvent::Receive(message) => {
                if queue.send(message).await.is_err() {
                    return;
                }
            }
            WsRecvEvent::Disconnect { .. } => return,
        }
    }
}

async fn handle_websocket(
    app: Arc<App>,
    websocket: Websocket,
    send: SendFn<WsSendEvent>,
    state: Arc<StdMutex<SharedState>>,
    extensions: std::collections::HashSet<String>,
) -> anyhow::Result<()> {
    let response = match app.handle_websocket(websocket).await {
        Ok(response) => response,
        Err(error) if app.config().propagate_exceptions => Some(diagnostic_response(&error)),
        Err(error) => anyhow::bail!("websocket handler failed: {error}"),
    };

    let (accepted, closed) = {
        let state = state.lock().expect("ws state lock");
        (state.accepted, state.closed)
    };

    match response {
        Some(response) if !accepted => {
            if extensions.contains("websocket.http.response") {
                send_rejection_response(&send, response).await?;
            } else if !closed {
                send(WsSendEvent::Close {
                    code: 1000,
                    reason: None,
                })
                .await?;
            }
        }
        _ => {
            if accepted && !closed {
                send(WsSendEvent::Close {
                    code: 1000,
                    reason: None,
                })
                .await?;
            }
        }
    }
    Ok(())
}

/// Stream an HTTP-style rejection over the websocket transport: the same
/// start / body chunks / empty-terminator triad as the HTTP adapter.
async fn send_rejection_response(
    send: &SendFn<WsSendEvent>,
    mut response: Response,
) -> anyhow::Result<()> {
    send(WsSendEvent::ResponseStart {
        status: response.status(),
        headers: response.headers().encode(),
    })
    .await?;

    while let Some(chunk) = response.body_mut().next_chunk().await? {
        send(WsSendEvent::ResponseBody {
            data: chunk,
            more: true,
        })
        .await?;
    }
    send(WsSendEvent::ResponseBody {
        data: Bytes::new(),
        more: false,
    })
    .await?;
    Ok(())
}
