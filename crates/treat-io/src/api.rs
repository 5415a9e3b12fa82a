//! HTTP request surface: status, photo capture, dispense and motion control.
//!
//! Served by `tiny_http` worker threads; each request is answered by
//! blocking on the async handles through the runtime handle.

use crate::capture::{CaptureError, CaptureHandle};
use crate::dispenser_task::{DispenserGone, DispenserHandle};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use treat_core::capture_name::parse_capture_name;
use treat_core::status::{capture_path, StatusProjection, CAPTURE_URL_PREFIX};

pub const BUSY_MESSAGE: &str =
    "Treat machine is busy. Please allow 60 seconds between treat dispense requests";
const CAPTURE_FAILED_MESSAGE: &str = "Error capturing photo";
const API_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to bind request surface on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error(transparent)]
    Dispenser(#[from] DispenserGone),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl ApiResponse {
    fn json<T: Serialize>(status: u16, value: &T) -> Result<Self, ApiError> {
        Ok(Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value)?,
        })
    }

    fn text(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: message.as_bytes().to_vec(),
        }
    }

    fn not_found() -> Self {
        Self::text(404, "Not Found")
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub dispenser: DispenserHandle,
    pub capture: CaptureHandle,
    pub capture_dir: PathBuf,
}

impl ApiState {
    pub async fn status(&self) -> Result<StatusProjection, ApiError> {
        let machine = self.dispenser.status().await?;
        let capture = self.capture.last_capture().await?;
        Ok(StatusProjection::build(
            &machine.treats,
            machine.state,
            capture.as_ref(),
            machine.now,
        ))
    }

    /// Answer one request. Failures become 500 responses here.
    pub async fn handle(&self, method: &Method, url: &str) -> ApiResponse {
        let path = url.split('?').next().unwrap_or(url);
        match self.route(method, path).await {
            Ok(response) => response,
            Err(e) => {
                error!(path, error = %e, "request failed");
                ApiResponse::text(500, &e.to_string())
            }
        }
    }

    async fn route(&self, method: &Method, path: &str) -> Result<ApiResponse, ApiError> {
        if let Some(name) = path.strip_prefix(CAPTURE_URL_PREFIX) {
            return match method {
                Method::Get => Ok(self.capture_file(name).await),
                _ => Ok(ApiResponse::text(405, "Method Not Allowed")),
            };
        }

        match (method, path) {
            (Method::Get, "/api/getStatus") => ApiResponse::json(200, &self.status().await?),
            (Method::Post, "/api/capturePhoto") => {
                info!("camera capture request from web");
                match self.capture.capture_photo().await {
                    Ok(name) => {
                        ApiResponse::json(200, &json!({ "capturePath": capture_path(&name) }))
                    }
                    Err(e) => {
                        error!(error = %e, "photo capture from web failed");
                        Ok(ApiResponse::text(500, CAPTURE_FAILED_MESSAGE))
                    }
                }
            }
            (Method::Post, "/api/dispenseTreat") => {
                info!("treat dispense request from web");
                if self.dispenser.dispense_treat().await? {
                    ApiResponse::json(200, &self.status().await?)
                } else {
                    Ok(ApiResponse::text(429, BUSY_MESSAGE))
                }
            }
            (Method::Post, "/api/motion/start") => self.motion(self.capture.start_motion().await),
            (Method::Post, "/api/motion/stop") => self.motion(self.capture.stop_motion().await),
            (
                _,
                "/api/getStatus"
                | "/api/capturePhoto"
                | "/api/dispenseTreat"
                | "/api/motion/start"
                | "/api/motion/stop",
            ) => Ok(ApiResponse::text(405, "Method Not Allowed")),
            _ => Ok(ApiResponse::not_found()),
        }
    }

    fn motion<T: Serialize>(&self, outcome: Result<T, CaptureError>) -> Result<ApiResponse, ApiError> {
        match outcome {
            Ok(status) => ApiResponse::json(200, &status),
            Err(e @ CaptureError::MotionUnsupported(_)) => Ok(ApiResponse::text(409, &e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn capture_file(&self, name: &str) -> ApiResponse {
        // Only well-formed capture names map to files; nothing else under
        // the capture directory is reachable.
        if parse_capture_name(name).is_err() {
            return ApiResponse::not_found();
        }
        match tokio::fs::read(self.capture_dir.join(name)).await {
            Ok(body) => ApiResponse {
                status: 200,
                content_type: "image/jpeg",
                body,
            },
            Err(e) => {
                warn!(capture = name, error = %e, "capture file not readable");
                ApiResponse::not_found()
            }
        }
    }
}

fn respond(request: Request, response: ApiResponse) {
    let mut reply = Response::from_data(response.body).with_status_code(response.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], response.content_type.as_bytes()) {
        reply = reply.with_header(header);
    }
    if let Err(e) = request.respond(reply) {
        warn!(error = %e, "failed to send response");
    }
}

/// Bind `addr` and serve requests on worker threads until the process ends.
pub fn serve_api(
    addr: &str,
    state: ApiState,
    runtime: Handle,
) -> Result<Vec<thread::JoinHandle<()>>, ApiError> {
    let server = Server::http(addr).map_err(|e| ApiError::Bind {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;
    info!("request surface listening on http://{}", addr);

    let server = Arc::new(server);
    let workers = (0..API_WORKERS)
        .map(|_| {
            let server = server.clone();
            let state = state.clone();
            let runtime = runtime.clone();
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    let method = request.method().clone();
                    let url = request.url().to_string();
                    let response = runtime.block_on(state.handle(&method, &url));
                    respond(request, response);
                }
            })
        })
        .collect();
    Ok(workers)
}
