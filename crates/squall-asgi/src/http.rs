//! The HTTP protocol adapter.
//!
//! [`AsgiHttpConnection`] bridges one bidirectional event stream to one
//! [`Request`] and one [`Response`]. Two tasks race: a receiver loop
//! draining body chunks into the request's buffer, and a handler task
//! running the application's dispatch pipeline and streaming the
//! response back. Whichever finishes first wins; the loser is cancelled
//! and awaited to quiescence before any error is re-surfaced, so no
//! orphaned work outlives the connection.

use std::sync::Arc;

use bytes::Bytes;
use squall_core::{App, DispatchError};
use squall_http::{
    BodyBuffer, HeaderMap, PushPromiseFn, Request, RequestHead, Response, TimeoutOverride,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{HttpRecvEvent, HttpScope, HttpSendEvent, SendFn, parse_spec_version};

/// Bridges one HTTP connection between the transport and the app.
pub struct AsgiHttpConnection {
    app: Arc<App>,
    scope: HttpScope,
}

impl AsgiHttpConnection {
    pub fn new(app: Arc<App>, scope: HttpScope) -> Self {
        Self { app, scope }
    }

    /// Drive the connection to completion.
    ///
    /// Transport-level cancellation is never swallowed here — the caller
    /// owns the cancellation policy. A response-send timeout, however, is
    /// abandoned silently: a client too slow to read its response gets
    /// whatever made it onto the wire.
    pub async fn run(
        self,
        receive: mpsc::Receiver<HttpRecvEvent>,
        send: SendFn<HttpSendEvent>,
    ) -> anyhow::Result<()> {
        let request = self.build_request(&send);

        let receiver_request = request.clone();
        let mut receiver_task = tokio::spawn(receive_body(receive, receiver_request));

        let app = self.app.clone();
        let handler_send = send.clone();
        let mut handler_task =
            tokio::spawn(async move { handle_request(app, request, handler_send).await });

        race_to_completion(&mut receiver_task, &mut handler_task).await
    }

    fn build_request(&self, send: &SendFn<HttpSendEvent>) -> Request {
        let config = self.app.config();

        let mut headers = HeaderMap::new();
        headers.insert(
            "Remote-Addr",
            self.scope
                .client
                .clone()
                .unwrap_or_else(|| "<local>".to_string()),
        );
        headers.extend(&HeaderMap::from_byte_pairs(&self.scope.headers));
        if parse_spec_version(&self.scope.http_version) < parse_spec_version("1.1") {
            headers.set_default("Host", config.server_name.clone().unwrap_or_default());
        }

        let expected_length = headers
            .get("content-length")
            .and_then(|value| value.parse().ok());
        let body = BodyBuffer::new(expected_length, config.max_content_length);

        let head = RequestHead {
            method: self.scope.method.clone(),
            scheme: self.scope.scheme.clone(),
            path: normalize_path(&self.scope.path, &self.scope.root_path),
            query_string: self.scope.query_string.clone(),
            headers,
            root_path: self.scope.root_path.clone(),
            http_version: self.scope.http_version.clone(),
            routing: None,
        };

        let mut request =
            Request::new(head, body).with_body_timeout(config.body_timeout_duration());
        if self.scope.extensions.contains("http.response.push") {
            request = request.with_push_promise(push_promise_fn(send.clone()));
        }
        request
    }
}

/// Strip the mount prefix and normalize odd request targets.
///
/// A path that is empty after prefix stripping, or whose prefix does not
/// match, becomes a single space — a value no route can match, so the
/// request fails routing as a 404 instead of crashing.
pub(crate) fn normalize_path(raw: &str, root_path: &str) -> String {
    let path = if raw.starts_with('/') {
        raw.to_string()
    } else {
        // An absolute-form target: keep only the path component.
        match raw.find("://").map(|i| i + 3) {
            Some(authority_start) => match raw[authority_start..].find('/') {
                Some(slash) => raw[authority_start + slash..].to_string(),
                None => "/".to_string(),
            },
            None => " ".to_string(),
        }
    };

    if root_path.is_empty() {
        return path;
    }
    match path.strip_prefix(root_path) {
        Some("") | None => " ".to_string(),
        Some(rest) => rest.to_string(),
    }
}

fn push_promise_fn(send: SendFn<HttpSendEvent>) -> PushPromiseFn {
    Arc::new(move |path, headers| {
        let send = send.clone();
        Box::pin(async move {
            if let Err(error) = send(HttpSendEvent::PushPromise {
                path,
                headers: headers.encode(),
            })
            .await
            {
                tracing::debug!(error = %error, "push promise send failed");
            }
        })
    })
}

// Keeps draining after the final body chunk: only a disconnect (or the
// channel closing) ends the loop, so the handler task normally wins the
// race and is never cancelled mid-response.
async fn receive_body(mut receive: mpsc::Receiver<HttpRecvEvent>, request: Request) {
    while let Some(event) = receive.recv().await {
        match event {
            HttpRecvEvent::Body { data, more } => {
                request.body().append(&data);
                if !more {
                    request.body().set_complete();
                }
            }
            HttpRecvEvent::Disconnect => return,
        }
    }
}

async fn handle_request(
    app: Arc<App>,
    request: Request,
    send: SendFn<HttpSendEvent>,
) -> anyhow::Result<()> {
    let response = match app.handle_request(request).await {
        Ok(response) => response,
        Err(error) if app.config().propagate_exceptions => diagnostic_response(&error),
        Err(error) => anyhow::bail!("request handler failed: {error}"),
    };

    let timeout = match response.timeout() {
        TimeoutOverride::Some(duration) => Some(duration),
        TimeoutOverride::None => None,
        TimeoutOverride::Unset => app.config().response_timeout_duration(),
    };

    match timeout {
        Some(duration) => {
            match tokio::time::timeout(duration, send_response(&send, response)).await {
                Ok(result) => result,
                Err(_) => {
                    // The client stopped reading or is too slow; nothing
                    // useful can be surfaced.
                    tracing::debug!("response send timed out, abandoning");
                    Ok(())
                }
            }
        }
        None => send_response(&send, response).await,
    }
}

async fn send_response(send: &SendFn<HttpSendEvent>, mut response: Response) -> anyhow::Result<()> {
    send(HttpSendEvent::ResponseStart {
        status: response.status(),
        headers: response.headers().encode(),
    })
    .await?;

    while let Some(chunk) = response.body_mut().next_chunk().await? {
        send(HttpSendEvent::ResponseBody {
            data: chunk,
            more: true,
        })
        .await?;
    }
    send(HttpSendEvent::ResponseBody {
        data: Bytes::new(),
        more: false,
    })
    .await?;
    Ok(())
}

/// A plain 500 carrying the error text, used in place of a debug
/// traceback view when the app is configured to propagate exceptions.
pub(crate) fn diagnostic_response(error: &DispatchError) -> Response {
    let mut response =
        Response::with_status(format!("Internal Server Error\n\n{error}"), 500);
    response
        .headers_mut()
        .set("Content-Type", "text/plain; charset=utf-8");
    response
}

/// Race the receiver loop against the handler task: cancel the loser,
/// await its cancellation, then surface the finisher's outcome.
pub(crate) async fn race_to_completion(
    receiver_task: &mut JoinHandle<()>,
    handler_task: &mut JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    tokio::select! {
        joined = &mut *receiver_task => {
            handler_task.abort();
            let abandoned = (&mut *handler_task).await;
            joined.map_err(|err| anyhow::anyhow!("receiver task panicked: {err}"))?;
            flatten_join(abandoned)
        }
        joined = &mut *handler_task => {
            receiver_task.abort();
            if let Err(err) = (&mut *receiver_task).await
                && !err.is_cancelled()
            {
                return Err(anyhow::anyhow!("receiver task panicked: {err}"));
            }
            flatten_join(joined)
        }
    }
}

fn flatten_join(
    joined: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(anyhow::anyhow!("task panicked: {err}")),
    }
}
