//! Demo HTTP front end using rouille.
//!
//! A thin, replaceable surface over the bridge: every control request is a
//! JSON body POSTed to `/api/control`, forwarded to the core verbatim, and
//! the core's reply comes back as the response body. `/api/status` is sugar
//! for the aggregated `{"control":{}}` query. The core never sees HTTP;
//! swapping this module for a different transport touches nothing else.
//!
//! rouille handles each request on its own thread, which is exactly the
//! blocking model [`FrontEndHandle::transact`] wants.

use std::io::Read;
use std::sync::Arc;
use std::thread;

use rouille::{Request, Response};
use serde::Serialize;

use crate::bridge::{BridgeError, FrontEndHandle};

/// Largest accepted request body, matching the peer-side frame cap.
const MAX_BODY_SIZE: u64 = 1024 * 1024;

/// Error/health response body.
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn ok_msg(msg: &str) -> Self {
        Self {
            success: true,
            message: Some(msg.to_string()),
            error: None,
        }
    }

    fn err(msg: &str) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(msg.to_string()),
        }
    }
}

/// HTTP front end. Runs on a background thread for the life of the
/// process.
#[derive(Debug)]
pub struct WebServer;

impl WebServer {
    /// Start serving on `addr`. Panics in the server thread if the address
    /// cannot be bound; the main thread keeps running on the core loop.
    pub fn start(addr: &str, handle: Arc<FrontEndHandle>) {
        let addr = addr.to_string();
        thread::spawn(move || {
            log::info!("[Web] front end listening on http://{addr}");
            rouille::start_server(&addr, move |request| {
                handle_request(request, &handle)
            });
        });
    }
}

fn handle_request(request: &Request, handle: &Arc<FrontEndHandle>) -> Response {
    rouille::router!(request,
        (GET) ["/api/health"] => {
            Response::json(&ApiResponse::ok_msg("mediahub control"))
        },

        // Aggregated link/config status.
        (GET) ["/api/status"] => {
            forward(handle, br#"{"control":{}}"#)
        },

        // Raw control envelope, forwarded to the core as-is.
        (POST) ["/api/control"] => {
            match read_body(request) {
                Ok(body) => forward(handle, &body),
                Err(resp) => resp,
            }
        },

        _ => {
            Response::json(&ApiResponse::err("not found")).with_status_code(404)
        }
    )
}

/// Pull the request body, bounded by [`MAX_BODY_SIZE`].
fn read_body(request: &Request) -> Result<Vec<u8>, Response> {
    let Some(data) = request.data() else {
        return Err(Response::json(&ApiResponse::err("missing request body"))
            .with_status_code(400));
    };
    let mut body = Vec::new();
    if let Err(e) = data.take(MAX_BODY_SIZE + 1).read_to_end(&mut body) {
        return Err(Response::json(&ApiResponse::err(&format!("body read failed: {e}")))
            .with_status_code(400));
    }
    if body.len() as u64 > MAX_BODY_SIZE {
        return Err(Response::json(&ApiResponse::err("request body too large"))
            .with_status_code(413));
    }
    Ok(body)
}

/// Run one bridge transaction and map its outcome onto HTTP.
fn forward(handle: &Arc<FrontEndHandle>, request: &[u8]) -> Response {
    match handle.transact(request) {
        Ok(reply) => Response::from_data("application/json", reply),
        Err(BridgeError::Timeout) => {
            Response::json(&ApiResponse::err("control core did not respond"))
                .with_status_code(408)
        }
        Err(BridgeError::Closed) => {
            Response::json(&ApiResponse::err("control core is not running"))
                .with_status_code(503)
        }
    }
}
