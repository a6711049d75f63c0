// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Proxy server: accept loop, request dispatch and plain-HTTP forwarding.

use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::record::{body_preview, method_carries_preview, response_preview, RequestRecord};
use crate::sink::ObservationSink;
use crate::sniff::{parse_message_head, MessageHead};
use crate::stream::{read_head, PrefixedStream};
use crate::watch::WatchList;
use crate::{mitm, tunnel};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a connection handler needs, shared across all connections.
pub struct ProxyState {
    pub config: Arc<Config>,
    pub watch: Arc<WatchList>,
    pub ca: Arc<CertificateAuthority>,
    pub sink: ObservationSink,
    client: Client<HttpConnector>,
}

impl ProxyState {
    pub fn new(
        config: Arc<Config>,
        watch: Arc<WatchList>,
        ca: Arc<CertificateAuthority>,
        sink: ObservationSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            watch,
            ca,
            sink,
            client: Client::new(),
        })
    }
}

/// Accept connections on `listen` until the future is dropped.
///
/// Each connection runs in its own task; nothing a connection does can stop
/// the accept loop.
pub async fn run_proxy(listen: SocketAddr, state: Arc<ProxyState>) -> Result<()> {
    let listener = TcpListener::bind(listen).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => Error::PortInUse(listen.port()),
        _ => Error::Transport(e),
    })?;
    info!(%listen, "listening");

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let conn_id = Uuid::new_v4();
                    debug!(%conn_id, %peer, "connection accepted");
                    if let Err(e) = serve_connection(state, socket, peer).await {
                        debug!(%conn_id, %peer, %e, "connection closed with error");
                    }
                });
            }
            Err(e) => {
                warn!(%e, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Read the first request head and dispatch: CONNECT to the tunnel paths,
/// everything else to the plain forwarder.
async fn serve_connection(
    state: Arc<ProxyState>,
    mut socket: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let Some((head_raw, leftover)) = read_head(&mut socket).await? else {
        return Ok(());
    };
    let head = parse_message_head(&head_raw);

    let mut tokens = head.start_line.split_whitespace();
    let (method, target) = match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some(method), Some(target), Some(_version), None) => {
            (method.to_string(), target.to_string())
        }
        _ => {
            write_error_response(&mut socket, 400, "Bad Request").await;
            return Err(Error::Parse(format!(
                "malformed request line: {}",
                head.start_line
            )));
        }
    };
    debug!(%peer, %method, %target, "request");

    let client = PrefixedStream::new(leftover, socket);
    if method == "CONNECT" {
        handle_connect(state, client, &target).await
    } else {
        handle_plain(state, client, &method, &target, &head).await
    }
}

/// CONNECT handling: acknowledge the tunnel, then either splice opaquely or
/// bridge through the MITM path depending on the watch list.
async fn handle_connect(
    state: Arc<ProxyState>,
    mut client: PrefixedStream<TcpStream>,
    target: &str,
) -> Result<()> {
    let (host, port) = match parse_connect_target(target) {
        Ok(v) => v,
        Err(e) => {
            write_error_response(&mut client, 400, "Bad Request").await;
            return Err(e);
        }
    };

    let watched = state.watch.matches(&host);
    let record = RequestRecord::new("CONNECT", &host, &format!(":{port}"), watched);
    state.sink.emit(&record).await;

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    // The client has its 200; from here on any failure is a plain close.
    if watched {
        mitm::bridge(
            client,
            &host,
            port,
            &state.ca,
            &state.sink,
            state.config.verbose,
        )
        .await
    } else {
        tunnel::splice(client, &host, port).await
    }
}

/// Forward one plain-HTTP request and stream the buffered response back.
async fn handle_plain(
    state: Arc<ProxyState>,
    mut client: PrefixedStream<TcpStream>,
    method: &str,
    target: &str,
    head: &MessageHead,
) -> Result<()> {
    let (uri, host) = match resolve_target(target, head.headers.first("host")) {
        Ok(v) => v,
        Err(e) => {
            write_error_response(&mut client, 400, "Bad Request").await;
            return Err(e);
        }
    };
    let hyper_method = match hyper::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            write_error_response(&mut client, 400, "Bad Request").await;
            return Err(Error::Parse(format!("invalid method token: {method}")));
        }
    };
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // The whole body is buffered before forwarding, so the sink sees one
    // coherent preview per request.
    let content_length = head.content_length();
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        client.read_exact(&mut body).await?;
    }

    let watched = state.watch.matches(&host);
    let mut record = RequestRecord::new(method, &host, &path, watched);
    if state.config.verbose && !head.headers.is_empty() {
        record.headers = Some(head.headers.clone());
    }
    if watched && method_carries_preview(method) && !body.is_empty() {
        record.body_preview = Some(body_preview(&body));
    }
    state.sink.emit(&record).await;

    let mut builder = Request::builder().method(hyper_method).uri(uri.clone());
    for (name, values) in head.headers.iter() {
        // The only hop-by-hop header stripped on the way out.
        if name == "proxy-connection" {
            continue;
        }
        for value in values {
            builder = builder.header(name, value.as_str());
        }
    }
    let upstream_req = match builder.body(Body::from(body)) {
        Ok(r) => r,
        Err(e) => {
            write_error_response(&mut client, 400, "Bad Request").await;
            return Err(Error::Parse(format!("cannot build upstream request: {e}")));
        }
    };

    let response = match state.client.request(upstream_req).await {
        Ok(r) => r,
        Err(e) => {
            warn!(%host, %e, "upstream request failed");
            write_error_response(&mut client, 502, "Bad Gateway").await;
            return Ok(());
        }
    };

    let status = response.status();
    let response_headers = response.headers().clone();
    let body_bytes = match hyper::body::to_bytes(response.into_body()).await {
        Ok(b) => b,
        Err(e) => {
            warn!(%host, %e, "upstream body read failed");
            write_error_response(&mut client, 502, "Bad Gateway").await;
            return Ok(());
        }
    };

    let preview = if state.config.verbose && watched {
        response_preview(&body_bytes)
    } else {
        None
    };
    record.attach_response(status.as_u16(), preview);
    state.sink.emit(&record).await;

    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response_headers.iter() {
        let name = name.as_str();
        // hyper already decoded any transfer encoding; the body goes back
        // with an explicit length.
        if is_hop_by_hop(name) || name == "content-length" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
    out.push_str(&format!("content-length: {}\r\n\r\n", body_bytes.len()));

    client.write_all(out.as_bytes()).await?;
    client.write_all(&body_bytes).await?;
    client.flush().await?;
    let _ = client.shutdown().await;
    Ok(())
}

/// Resolve the request target of a non-CONNECT request to an absolute URI
/// plus the lowercased host addressed by the client.
fn resolve_target(target: &str, host_header: Option<&str>) -> Result<(Uri, String)> {
    let uri: Uri = if target.starts_with('/') {
        let host = host_header
            .ok_or_else(|| Error::Parse("origin-form request without Host header".into()))?;
        format!("http://{host}{target}")
            .parse()
            .map_err(|e| Error::Parse(format!("bad request target {target}: {e}")))?
    } else {
        target
            .parse()
            .map_err(|e| Error::Parse(format!("bad request target {target}: {e}")))?
    };

    if uri.scheme().is_none() {
        return Err(Error::Parse(format!(
            "request target is not absolute: {target}"
        )));
    }
    let host = uri
        .host()
        .ok_or_else(|| Error::Parse(format!("request target has no host: {target}")))?
        .to_ascii_lowercase();
    Ok((uri, host))
}

/// Split a CONNECT target into host and port, defaulting to 443.
fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::Parse(format!("bad CONNECT port in {target}")))?;
            (host, port)
        }
        None => (target, 443),
    };
    if host.is_empty() {
        return Err(Error::Parse(format!("bad CONNECT target {target}")));
    }
    Ok((host.to_ascii_lowercase(), port))
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

async fn write_error_response<S>(stream: &mut S, code: u16, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    let msg = format!(
        "HTTP/1.1 {code} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reason}",
        reason.len()
    );
    let _ = stream.write_all(msg.as_bytes()).await;
    let _ = stream.flush().await;
}
