//! HTTP surface: management API, event ingestion and the proxy catch-all
//!
//! Routes:
//! - `GET    /health`             liveness probe
//! - `GET    /api/exhibits`       list definitions with runtime status
//! - `POST   /api/exhibits`       create a definition (JSON body)
//! - `GET    /api/exhibits/{id}`  one definition with runtime status
//! - `DELETE /api/exhibits/{id}`  delete a definition
//! - `POST   /api/events`         ingest a lifecycle event envelope
//! - `/exhibit/{id}/...`          proxied pass-through to the backend

use crate::domain::{ExhibitDto, LifecycleEvent};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::exhibit::{ExhibitError, ExhibitService};
use crate::handler::{HandlerError, ProvisionerHandler};
use crate::provisioner::ApplicationProvisioner;
use crate::proxy::ApplicationProxy;
use crate::runtime_info::RuntimeInfoService;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything the HTTP surface dispatches into
pub struct GatewayServices {
    pub exhibits: Arc<ExhibitService>,
    pub runtime_info: Arc<RuntimeInfoService>,
    pub provisioner: Arc<ApplicationProvisioner>,
    pub handler: Arc<ProvisionerHandler>,
    pub proxy: Arc<ApplicationProxy>,
}

/// The gateway HTTP server
pub struct ApiServer {
    listener: TcpListener,
    services: Arc<GatewayServices>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    /// Bind the listener; `local_addr` is available before `run`
    pub async fn bind(
        addr: SocketAddr,
        services: Arc<GatewayServices>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            services,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Gateway listening (HTTP/1.1 and HTTP/2)");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let services = Arc::clone(&self.services);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let services = Arc::clone(&services);
                                    async move { route(req, services).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn route(
    req: Request<Incoming>,
    services: Arc<GatewayServices>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();

    // proxy catch-all first: it sees the highest traffic
    if let Some(rest) = path.strip_prefix("/exhibit/") {
        let exhibit_id = rest.split('/').next().unwrap_or("");
        if exhibit_id.is_empty() {
            return Ok(json_error_response(
                GatewayErrorCode::InvalidRequest,
                "Missing exhibit id in proxy path",
            ));
        }
        let exhibit_id = exhibit_id.to_string();
        return Ok(services.proxy.handle(&exhibit_id, req).await);
    }

    match (req.method().clone(), path.as_str()) {
        (Method::GET, "/health") => Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({"status": "ok"}),
        )),
        (Method::GET, "/api/exhibits") => list_exhibits(&services).await,
        (Method::POST, "/api/exhibits") => create_exhibit(req, &services).await,
        (Method::POST, "/api/events") => ingest_event(req, &services).await,
        (method, _) => {
            if let Some(id) = path.strip_prefix("/api/exhibits/") {
                let id = id.to_string();
                return match method {
                    Method::GET => get_exhibit(&id, &services).await,
                    Method::DELETE => delete_exhibit(&id, &services).await,
                    _ => Ok(json_error_response(
                        GatewayErrorCode::InvalidRequest,
                        "Method not allowed",
                    )),
                };
            }
            Ok(json_error_response(
                GatewayErrorCode::UnknownExhibit,
                "Not found",
            ))
        }
    }
}

async fn list_exhibits(
    services: &GatewayServices,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let exhibits = match services.exhibits.get_all().await {
        Ok(exhibits) => exhibits,
        Err(e) => {
            error!(error = %e, "Failed to list exhibits");
            return Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "Failed to list exhibits",
            ));
        }
    };

    let mut dtos = Vec::with_capacity(exhibits.len());
    for exhibit in exhibits {
        let status = match services.runtime_info.get(&exhibit.id).await {
            Ok(info) => info.status,
            Err(e) => {
                warn!(exhibit_id = %exhibit.id, error = %e, "Failed to read runtime status");
                crate::domain::RuntimeStatus::Stopped
            }
        };
        dtos.push(ExhibitDto { exhibit, status });
    }

    Ok(json_response(StatusCode::OK, &dtos))
}

async fn get_exhibit(
    id: &str,
    services: &GatewayServices,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let exhibit = match services.exhibits.get(id).await {
        Ok(exhibit) => exhibit,
        Err(ExhibitError::NotFound(_)) => {
            return Ok(json_error_response(
                GatewayErrorCode::UnknownExhibit,
                format!("No exhibit with id {}", id),
            ));
        }
        Err(e) => {
            error!(exhibit_id = id, error = %e, "Failed to load exhibit");
            return Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "Failed to load exhibit",
            ));
        }
    };

    let status = match services.runtime_info.get(id).await {
        Ok(info) => info.status,
        Err(e) => {
            warn!(exhibit_id = id, error = %e, "Failed to read runtime status");
            crate::domain::RuntimeStatus::Stopped
        }
    };

    Ok(json_response(StatusCode::OK, &ExhibitDto { exhibit, status }))
}

async fn create_exhibit(
    req: Request<Incoming>,
    services: &GatewayServices,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();

    let definition = match serde_json::from_slice(&body) {
        Ok(definition) => definition,
        Err(e) => {
            warn!(error = %e, "Invalid exhibit definition");
            return Ok(json_error_response(
                GatewayErrorCode::InvalidRequest,
                format!("Invalid exhibit definition: {}", e),
            ));
        }
    };

    match services.exhibits.create(definition).await {
        Ok(id) => Ok(json_response(
            StatusCode::CREATED,
            &serde_json::json!({"status": "created", "id": id}),
        )),
        Err(ExhibitError::Validation(reason)) => Ok(json_error_response(
            GatewayErrorCode::InvalidRequest,
            reason,
        )),
        Err(e) => {
            error!(error = %e, "Failed to create exhibit");
            Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "Failed to create exhibit",
            ))
        }
    }
}

async fn delete_exhibit(
    id: &str,
    services: &GatewayServices,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // best-effort stop of a live backend before the records disappear
    if let Err(e) = services.provisioner.stop(id).await {
        warn!(exhibit_id = id, error = %e, "Failed to stop backend before delete");
    }

    match services.exhibits.delete(id).await {
        Ok(()) => Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .expect("valid response builder")),
        Err(ExhibitError::NotFound(_)) => Ok(json_error_response(
            GatewayErrorCode::UnknownExhibit,
            format!("No exhibit with id {}", id),
        )),
        Err(e) => {
            error!(exhibit_id = id, error = %e, "Failed to delete exhibit");
            Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "Failed to delete exhibit",
            ))
        }
    }
}

/// Ingest one lifecycle event envelope. Handler failures propagate into the
/// response instead of acknowledging the event blindly.
async fn ingest_event(
    req: Request<Incoming>,
    services: &GatewayServices,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();

    let event: LifecycleEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Invalid lifecycle event");
            return Ok(json_error_response(
                GatewayErrorCode::InvalidRequest,
                format!("Invalid lifecycle event: {}", e),
            ));
        }
    };

    match services.handler.handle(&event).await {
        Ok(()) => Ok(json_response(
            StatusCode::CREATED,
            &serde_json::json!({"status": "accepted", "id": event.id}),
        )),
        Err(HandlerError::Exhibit(ExhibitError::NotFound(id))) => Ok(json_error_response(
            GatewayErrorCode::UnknownExhibit,
            format!("No exhibit with id {}", id),
        )),
        Err(HandlerError::Provision(e)) => {
            error!(event_id = %event.id, error = %e, "Event provisioning failed");
            Ok(json_error_response(
                GatewayErrorCode::BackendStartFailed,
                e.to_string(),
            ))
        }
        Err(e) => {
            error!(event_id = %event.id, error = %e, "Event handling failed");
            Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "Event handling failed",
            ))
        }
    }
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with static headers")
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}
