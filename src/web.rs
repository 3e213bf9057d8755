// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The inbound HTTP surface: a demo page and the per-stream WebSocket
//! endpoint feeding Media Source Extensions in the browser.

use crate::cctv::Cctv;
use base::{err, Error};
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const DEMO_PAGE: &str = include_str!("../ui/live.html");

/// Serves HTTP on `addr` (`":8080"` or `"host:8080"`) until the CCTV root
/// stops.
pub async fn serve(cctv: Arc<Cctv>, addr: &str) -> Result<(), Error> {
    let addr = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_owned(),
    };
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| err!(Unavailable, msg("can't listen on {addr}"), source(e)))?;
    info!("webcast server listening on {addr}");
    let token = cctv.sup().token().clone();
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            r = listener.accept() => match r {
                Ok((socket, _peer)) => {
                    let cctv = cctv.clone();
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| handle_request(cctv.clone(), req));
                        let conn = http1::Builder::new()
                            .serve_connection(TokioIo::new(socket), service)
                            .with_upgrades();
                        if let Err(e) = conn.await {
                            debug!(err = %e, "http connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(err = %e, "accept failed"),
            }
        }
    }
}

async fn handle_request(
    cctv: Arc<Cctv>,
    mut req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let response = if method == Method::OPTIONS {
        empty(StatusCode::NO_CONTENT)
    } else if method == Method::GET && path == "/" {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(Bytes::from_static(DEMO_PAGE.as_bytes())))
            .expect("static response should build")
    } else if method == Method::GET {
        match parse_stream_path(&path) {
            Some((camera, stream)) => stream_endpoint(cctv, &mut req, camera, stream),
            None => empty(StatusCode::NOT_FOUND),
        }
    } else {
        empty(StatusCode::NOT_FOUND)
    };
    Ok(add_cors(response))
}

/// `/stream/<camera>/<stream id>`.
fn parse_stream_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/stream/")?;
    let (camera, stream) = rest.split_once('/')?;
    if camera.is_empty() || stream.is_empty() || stream.contains('/') {
        return None;
    }
    Some((camera, stream))
}

/// Upgrades to WebSocket and hands the connection to the stream's caster.
/// The caster lookup can block on the camera pipeline coming up, so it
/// happens in the upgraded task, not before the 101 response.
fn stream_endpoint(
    cctv: Arc<Cctv>,
    req: &mut Request<Incoming>,
    camera: &str,
    stream: &str,
) -> Response<Full<Bytes>> {
    if !cctv.webcast_ids().contains(&format!("{camera}/{stream}")) {
        return empty(StatusCode::NOT_FOUND);
    }
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return empty(StatusCode::BAD_REQUEST);
    };
    let accept = derive_accept_key(key.as_bytes());
    let upgrade = hyper::upgrade::on(req);
    let camera = camera.to_owned();
    let stream = stream.to_owned();
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(u) => u,
            Err(e) => {
                debug!(err = %e, "websocket upgrade failed");
                return;
            }
        };
        let ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        match cctv.get_caster(&camera, &stream).await {
            Some(caster) => caster.add_viewer(ws),
            None => {
                // The pipeline is coming down; nothing to attach to.
                let mut ws = ws;
                let _ = ws.close(None).await;
            }
        }
    });
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()))
        .expect("static response should build")
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response should build")
}

fn add_cors(mut r: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    let h = r.headers_mut();
    h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".parse().expect("valid header"));
    h.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        "true".parse().expect("valid header"),
    );
    h.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        "Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization, accept, origin, Cache-Control, X-Requested-With"
            .parse()
            .expect("valid header"),
    );
    h.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        "POST, OPTIONS, GET, PUT, DELETE".parse().expect("valid header"),
    );
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_paths() {
        assert_eq!(parse_stream_path("/stream/porch/0"), Some(("porch", "0")));
        assert_eq!(parse_stream_path("/stream/porch"), None);
        assert_eq!(parse_stream_path("/stream/porch/0/x"), None);
        assert_eq!(parse_stream_path("/stream//0"), None);
        assert_eq!(parse_stream_path("/other/porch/0"), None);
    }

    #[test]
    fn cors_headers_present() {
        let r = add_cors(empty(StatusCode::NO_CONTENT));
        assert_eq!(r.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            r.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "POST, OPTIONS, GET, PUT, DELETE"
        );
    }
}
