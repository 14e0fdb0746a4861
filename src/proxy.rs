//! Request-time orchestration: resolve, ensure running, rewrite, forward

use crate::domain::{LifecycleEvent, RuntimeStatus};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::eventing::Eventing;
use crate::handler::ProvisionerHandler;
use crate::pool::ConnectionPool;
use crate::resolver::{ApplicationResolver, ResolveError};
use crate::rewrite::RewriteService;
use crate::runtime_info::{LastAccessedService, RuntimeInfoError, RuntimeInfoService};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Tuning for the proxy path
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// How long a request waits for an on-demand start to finish
    pub start_wait_timeout: Duration,
    /// Poll interval while waiting on runtime info
    pub start_poll_interval: Duration,
    /// Outbound request timeout against the backend
    pub request_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            start_wait_timeout: Duration::from_secs(60),
            start_poll_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Proxies one request to an exhibit's backend, starting it on demand
pub struct ApplicationProxy {
    resolver: Arc<ApplicationResolver>,
    runtime_info: Arc<RuntimeInfoService>,
    last_accessed: Arc<LastAccessedService>,
    rewrites: Arc<RewriteService>,
    eventing: Arc<dyn Eventing>,
    handler: Arc<ProvisionerHandler>,
    pool: Arc<ConnectionPool>,
    settings: ProxySettings,
}

impl ApplicationProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<ApplicationResolver>,
        runtime_info: Arc<RuntimeInfoService>,
        last_accessed: Arc<LastAccessedService>,
        rewrites: Arc<RewriteService>,
        eventing: Arc<dyn Eventing>,
        handler: Arc<ProvisionerHandler>,
        pool: Arc<ConnectionPool>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            resolver,
            runtime_info,
            last_accessed,
            rewrites,
            eventing,
            handler,
            pool,
            settings,
        }
    }

    /// Handle one proxied request for an exhibit
    pub async fn handle<B>(
        &self,
        exhibit_id: &str,
        req: Request<B>,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let address = match self.resolver.resolve(exhibit_id).await {
            Ok(address) => address,
            Err(ResolveError::NotRunning(_)) => {
                debug!(exhibit_id, "Backend not running, starting on demand");
                match self.start_and_wait(exhibit_id).await {
                    Ok(address) => address,
                    Err(response) => return *response,
                }
            }
            Err(ResolveError::Infrastructure(e)) => {
                error!(exhibit_id, error = %e, "Resolution failed");
                return json_error_response(
                    GatewayErrorCode::InfrastructureError,
                    "Failed to resolve backend",
                );
            }
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(exhibit_id, error = %e, "Failed to read request body");
                return json_error_response(
                    GatewayErrorCode::InvalidRequest,
                    "Failed to read request body",
                );
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut headers = parts.headers.clone();
        let (backend_path, body) = match self.rewrites.rewrite_client_request(
            exhibit_id,
            &mut headers,
            &path_and_query,
            body.to_vec(),
        ) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!(exhibit_id, error = %e, "Request rewrite failed");
                return json_error_response(GatewayErrorCode::RewriteFailed, e.to_string());
            }
        };

        let uri = format!("http://{}{}", address, backend_path);
        let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);
        for (name, value) in headers.iter() {
            if name != HOST {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header(HOST, address.as_str());

        let backend_req = match builder.body(Full::new(Bytes::from(body))) {
            Ok(r) => r,
            Err(e) => {
                error!(exhibit_id, error = %e, "Failed to build backend request");
                return json_error_response(GatewayErrorCode::InternalError, "Bad request build");
            }
        };

        debug!(exhibit_id, uri, "Forwarding request");
        let result = tokio::time::timeout(
            self.settings.request_timeout,
            self.pool.send_request(backend_req),
        )
        .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                // the cached address may be stale; the next request re-resolves
                self.resolver.invalidate(exhibit_id);
                error!(exhibit_id, address, error = %e, "Failed to reach backend");
                return json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                );
            }
            Err(_) => {
                warn!(
                    exhibit_id,
                    timeout_secs = self.settings.request_timeout.as_secs(),
                    "Backend request timed out"
                );
                return json_error_response(
                    GatewayErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.settings.request_timeout.as_secs()
                    ),
                );
            }
        };

        let (mut parts, body) = response.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!(exhibit_id, error = %e, "Failed to read backend response");
                return json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Failed to read backend response",
                );
            }
        };

        let rewritten =
            match self
                .rewrites
                .rewrite_server_response(exhibit_id, &mut parts.headers, body.to_vec())
            {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    warn!(exhibit_id, error = %e, "Response rewrite failed");
                    return json_error_response(GatewayErrorCode::RewriteFailed, e.to_string());
                }
            };
        // the body was re-framed with a concrete length
        parts.headers.remove(hyper::header::TRANSFER_ENCODING);

        if let Err(e) = self.last_accessed.touch(exhibit_id).await {
            warn!(exhibit_id, error = %e, "Failed to update last-accessed");
        }

        Response::from_parts(
            parts,
            Full::new(Bytes::from(rewritten))
                .map_err(|never| match never {})
                .boxed(),
        )
    }

    /// Publish a start event and poll runtime info under the read lock until
    /// the backend is Running, it failed, or the wait deadline passes.
    async fn start_and_wait(
        &self,
        exhibit_id: &str,
    ) -> Result<String, Box<Response<BoxBody<Bytes, hyper::Error>>>> {
        let event = LifecycleEvent::start(exhibit_id);
        if let Err(e) = self.eventing.publish(event.clone()).await {
            error!(exhibit_id, error = %e, "Failed to publish start event");
            return Err(Box::new(json_error_response(
                GatewayErrorCode::InternalError,
                "Failed to publish start event",
            )));
        }

        // without a consuming transport the publisher dispatches the work
        if !self.eventing.delivers() {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&event).await {
                    warn!(
                        exhibit_id = %event.data.exhibit_id,
                        error = %e,
                        "On-demand start failed"
                    );
                }
            });
        }

        let deadline = tokio::time::Instant::now() + self.settings.start_wait_timeout;
        loop {
            match self.runtime_info.get(exhibit_id).await {
                Ok(info) => match info.status {
                    RuntimeStatus::Running => {
                        if let Some(address) = info.address {
                            return Ok(address);
                        }
                    }
                    RuntimeStatus::Failed => {
                        return Err(Box::new(json_error_response(
                            GatewayErrorCode::BackendStartFailed,
                            "Backend failed to start",
                        )));
                    }
                    _ => {}
                },
                // the provisioner holds the write lock through the whole
                // start; a lock timeout here just means it is still busy
                Err(RuntimeInfoError::Lock(_)) => {}
                Err(RuntimeInfoError::Store(e)) => {
                    error!(exhibit_id, error = %e, "Failed to read runtime info");
                    return Err(Box::new(json_error_response(
                        GatewayErrorCode::InfrastructureError,
                        "Failed to read runtime info",
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(exhibit_id, "Timed out waiting for backend start");
                return Err(Box::new(json_error_response(
                    GatewayErrorCode::BackendStartTimeout,
                    "Timed out waiting for backend to start",
                )));
            }
            tokio::time::sleep(self.settings.start_poll_interval).await;
        }
    }
}
