//! Request composition and execution shared by every endpoint.
//!
//! An [`Endpoint`] turns its parameters into a [`PreparedRequest`] and
//! decodes the response body. The [`Executor`] owns everything around that:
//! common query parameters, signing, timeouts, the worker limit,
//! cancellation, and mapping HTTP failures onto [`Error`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SharedConfig};
use crate::crypto::EncryptionProvider;
use crate::error::{Error, Result, ServerErrorKind};
use crate::signature::{Query, sign_request};
use crate::state::StateStore;
use crate::status::{Operation, Status, StatusCategory};
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};

pub(crate) const SDK_NAME: &str = concat!("pubsub-client-rust/", env!("CARGO_PKG_VERSION"));

/// Wire-level description of a request, before common parameters and
/// signing are applied. `path` must already be percent-encoded.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub path: String,
    pub query: Query,
    pub body: Option<Vec<u8>>,
    pub channels: Vec<String>,
    pub groups: Vec<String>,
}

impl PreparedRequest {
    pub fn get(path: String) -> Self {
        Self {
            method: Method::Get,
            path,
            query: Query::new(),
            body: None,
            channels: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_targets(mut self, channels: &[String], groups: &[String]) -> Self {
        self.channels = channels.to_vec();
        self.groups = groups.to_vec();
        self
    }
}

/// View of the client handed to endpoints while preparing and decoding.
pub struct RequestContext<'a> {
    inner: &'a ExecutorInner,
    uuid: String,
}

impl RequestContext<'_> {
    pub fn config(&self) -> &Config {
        self.inner.config.get()
    }

    /// Current UUID (runtime-mutable).
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn cipher(&self) -> Option<&dyn EncryptionProvider> {
        self.inner.cipher.as_deref()
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    pub(crate) fn filter_expression(&self) -> Option<String> {
        self.inner.config.filter_expression()
    }

    /// Publish sequence number, 1..=65535 wrapping.
    pub(crate) fn next_sequence(&self) -> u32 {
        let prev = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        prev % 65_535 + 1
    }
}

/// One service operation: validation, request composition and decoding.
pub trait Endpoint: Send + Sync {
    type Output: Send;

    fn operation(&self) -> Operation;

    /// Validate inputs and compose the request. Runs before any I/O.
    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest>;

    fn decode(&self, response: &HttpResponse, ctx: &RequestContext<'_>) -> Result<Self::Output>;

    /// Hook run after a successful decode.
    fn on_success(&self, _output: &Self::Output, _ctx: &RequestContext<'_>) {}
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub(crate) struct ExecutorInner {
    config: SharedConfig,
    transport: Arc<dyn Transport>,
    cipher: Option<Arc<dyn EncryptionProvider>>,
    state: StateStore,
    workers: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    sequence: AtomicU32,
}

/// Runs endpoints through the transport. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub(crate) struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(
        config: SharedConfig,
        transport: Arc<dyn Transport>,
        cipher: Option<Arc<dyn EncryptionProvider>>,
        state: StateStore,
    ) -> Self {
        let max_workers = config.get().max_workers;
        let workers = (max_workers > 0).then(|| Arc::new(Semaphore::new(max_workers)));
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                transport,
                cipher,
                state,
                workers,
                shutdown: CancellationToken::new(),
                sequence: AtomicU32::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SharedConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    pub fn cipher(&self) -> Option<Arc<dyn EncryptionProvider>> {
        self.inner.cipher.clone()
    }

    pub fn context(&self) -> RequestContext<'_> {
        RequestContext {
            inner: &self.inner,
            uuid: self.inner.config.uuid(),
        }
    }

    /// Token cancelled when the owning client is destroyed.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Execute `endpoint`, returning the decoded output and the status
    /// descriptor. Never retries: the subscribe loop owns reconnection.
    pub async fn run<E: Endpoint>(
        &self,
        endpoint: &E,
        cancel: Option<CancellationToken>,
    ) -> (Result<E::Output>, Status) {
        let operation = endpoint.operation();
        let ctx = self.context();

        let prepared = match endpoint.prepare(&ctx) {
            Ok(p) => p,
            Err(e) => {
                let status = Status::from_error(operation, &e);
                return (Err(e), status);
            }
        };
        let channels = prepared.channels.clone();
        let groups = prepared.groups.clone();

        let outcome = self.send(operation, prepared, cancel).await;
        let result = outcome.and_then(|resp| {
            let out = endpoint.decode(&resp, &ctx)?;
            Ok((out, resp.status))
        });

        match result {
            Ok((out, code)) => {
                endpoint.on_success(&out, &ctx);
                let status = Status::new(operation, StatusCategory::Acknowledgment)
                    .with_targets(&channels, &groups)
                    .with_status_code(code);
                (Ok(out), status)
            }
            Err(e) => {
                tracing::debug!(%operation, error = %e, "request failed");
                let status = Status::from_error(operation, &e).with_targets(&channels, &groups);
                (Err(e), status)
            }
        }
    }

    async fn send(
        &self,
        operation: Operation,
        prepared: PreparedRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<HttpResponse> {
        let request = self.build_http_request(operation, prepared)?;
        let cancel = cancel.unwrap_or_default();
        let shutdown = &self.inner.shutdown;
        if cancel.is_cancelled() || shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let _permit = match (&self.inner.workers, is_long_lived(operation)) {
            (Some(workers), false) => tokio::select! {
                permit = workers.acquire() => Some(permit.map_err(|_| Error::Cancelled)?),
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = shutdown.cancelled() => return Err(Error::Cancelled),
            },
            _ => None,
        };

        tracing::debug!(%operation, method = %request.method, url = %redact_url(&request.url), "sending request");
        let response = tokio::select! {
            resp = self.inner.transport.send(request) => resp?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = shutdown.cancelled() => return Err(Error::Cancelled),
        };

        if response.status >= 400 {
            return Err(server_error(response.status, &response.body));
        }
        Ok(response)
    }

    fn build_http_request(
        &self,
        operation: Operation,
        prepared: PreparedRequest,
    ) -> Result<HttpRequest> {
        let config = self.inner.config.get();
        let PreparedRequest {
            method,
            path,
            mut query,
            body,
            ..
        } = prepared;

        query.push("uuid", self.inner.config.uuid());
        query.push("pnsdk", SDK_NAME);
        query.push_opt("auth", self.inner.config.auth_key());

        if let Some(secret) = config.secret_key.as_deref() {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            query.push("timestamp", timestamp.to_string());
            let signature = sign_request(
                secret,
                method,
                &config.publish_key,
                &path,
                &query,
                body.as_deref(),
            )?;
            query.push("signature", signature);
        }

        let base = config.base_url()?;
        let url = format!(
            "{}{path}?{}",
            base.as_str().trim_end_matches('/'),
            query.to_canonical_string()
        );
        let timeout = if operation == Operation::Subscribe {
            config.subscribe_request_timeout
        } else {
            config.non_subscribe_request_timeout
        };

        Ok(HttpRequest {
            method,
            url,
            headers: Vec::new(),
            body,
            timeout,
        })
    }

    pub fn cancel_all(&self) {
        self.inner.shutdown.cancel();
        if let Some(workers) = &self.inner.workers {
            workers.close();
        }
    }
}

/// Long-lived workers bypass the one-shot worker limit.
fn is_long_lived(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::Subscribe | Operation::Heartbeat | Operation::Leave
    )
}

fn redact_url(url: &str) -> String {
    match url.split_once('?') {
        Some((path, _)) => format!("{path}?…"),
        None => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// Translate an HTTP >= 400 answer into [`Error::Server`], extracting the
/// service message from whichever envelope shape the endpoint uses.
pub(crate) fn server_error(status: u16, body: &[u8]) -> Error {
    let json: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let message = json
        .as_ref()
        .and_then(error_message)
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(body).trim().to_string();
            if text.is_empty() {
                format!("HTTP {status}")
            } else {
                text
            }
        });
    Error::Server {
        status,
        kind: ServerErrorKind::from_status(status),
        message,
        body: json,
    }
}

fn error_message(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| map.get("error_message").and_then(|m| m.as_str()))
            .or_else(|| {
                map.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
            })
            .map(String::from),
        serde_json::Value::Array(arr) => arr.get(1).and_then(|m| m.as_str()).map(String::from),
        _ => None,
    }
}

pub(crate) fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::decoding(format!("response body: {e}")))
}

/// Parse a timetoken that the service may send as a string or a number.
pub(crate) fn parse_timetoken(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Public builder
// ---------------------------------------------------------------------------

/// Fluent builder for a one-shot operation. Endpoint-specific setters are
/// defined next to each endpoint; the terminal methods live here.
#[must_use = "requests do nothing until executed"]
pub struct RequestBuilder<E> {
    pub(crate) executor: Executor,
    pub(crate) endpoint: E,
}

impl<E: Endpoint> RequestBuilder<E> {
    pub(crate) fn new(executor: Executor, endpoint: E) -> Self {
        Self { executor, endpoint }
    }

    pub async fn execute(self) -> Result<E::Output> {
        self.executor.run(&self.endpoint, None).await.0
    }

    /// Execute, aborting the transport call when `cancel` fires.
    pub async fn execute_with_cancel(self, cancel: CancellationToken) -> Result<E::Output> {
        self.executor.run(&self.endpoint, Some(cancel)).await.0
    }

    /// Execute and also return the status descriptor.
    pub async fn execute_with_status(
        self,
        cancel: Option<CancellationToken>,
    ) -> (Result<E::Output>, Status) {
        self.executor.run(&self.endpoint, cancel).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;

    use super::*;
    use crate::transport::TransportError;

    /// Transport that fails every request; for tests that only prepare or
    /// decode.
    pub struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Err(TransportError {
                message: "null transport".into(),
                timed_out: false,
            })
        }
    }

    pub fn executor(config: Config) -> Executor {
        Executor::new(
            SharedConfig::new(config),
            Arc::new(NullTransport),
            None,
            StateStore::new(),
        )
    }

    pub fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            body: body.as_bytes().to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
