//! CONNECT tunneling.
//!
//! The tunnel is opaque: once established, bytes are spliced verbatim in
//! both directions until either side closes. No header inspection or
//! injection happens inside it.

use crate::proxy::{empty, text_response, ProxyBody};
use http::StatusCode;
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

pub(crate) async fn serve(req: Request<Incoming>, dial_timeout: Duration) -> Response<ProxyBody> {
    let authority = match req.uri().authority() {
        Some(authority) if authority.port_u16().is_some() => authority.clone(),
        _ => {
            return text_response(
                StatusCode::BAD_REQUEST,
                "CONNECT target must be host:port",
            )
        }
    };

    let mut upstream =
        match tokio::time::timeout(dial_timeout, TcpStream::connect(authority.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                debug!(target = %authority, %error, "CONNECT dial failed");
                return text_response(StatusCode::BAD_GATEWAY, format!("dial failed: {error}"));
            }
            Err(_) => {
                debug!(target = %authority, "CONNECT dial timed out");
                return text_response(StatusCode::BAD_GATEWAY, "dial timed out");
            }
        };
    let _ = upstream.set_nodelay(true);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut downstream = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
                    Ok((tx, rx)) => {
                        trace!(target = %authority, tx, rx, "tunnel closed");
                    }
                    Err(error) => {
                        debug!(target = %authority, %error, "tunnel terminated");
                    }
                }
            }
            Err(error) => {
                debug!(target = %authority, %error, "CONNECT upgrade failed");
            }
        }
    });

    Response::new(empty())
}
