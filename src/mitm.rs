// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! MITM TLS bridge: terminate client TLS with a minted leaf, re-dial the
//! real host, and splice while the sniffer watches the plaintext.

use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::record::RequestRecord;
use crate::sink::ObservationSink;
use crate::sniff::{RequestSniffer, ResponseScanner};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Accepts whatever certificate the real endpoint presents.
///
/// Deliberate trade-off for an interception tool: the operator opted in by
/// installing our private root, and the upstream chain may be staged or
/// unusual. Validation toward the origin is therefore disabled.
struct NoVerification;

impl rustls::client::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn insecure_client_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth(),
    )
}

/// Bridge one intercepted tunnel.
///
/// The caller has already sent `200 Connection Established`. Both TLS
/// sessions are set up here; afterwards bytes are forwarded in both
/// directions with the request sniffer tapping client-to-server traffic and
/// the response scanner tapping the way back. Either side's close shuts the
/// other down.
pub async fn bridge<S>(
    client: S,
    host: &str,
    port: u16,
    ca: &Arc<CertificateAuthority>,
    sink: &ObservationSink,
    verbose: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let leaf = ca.leaf_for(host).await?;
    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(leaf.chain.clone(), leaf.key.clone())
        .map_err(|e| Error::Tls(format!("leaf for {host} rejected: {e}")))?;

    let client_tls = TlsAcceptor::from(Arc::new(server_config))
        .accept(client)
        .await
        .map_err(|e| Error::Tls(format!("client handshake failed: {e}")))?;

    let upstream_tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Upstream(format!("cannot reach {host}:{port}: {e}")))?;
    let server_name = rustls::ServerName::try_from(host)
        .map_err(|_| Error::Tls(format!("invalid server name {host}")))?;
    let upstream_tls = TlsConnector::from(insecure_client_config())
        .connect(server_name, upstream_tcp)
        .await
        .map_err(|e| Error::Tls(format!("upstream handshake with {host} failed: {e}")))?;

    debug!(%host, port, "mitm bridge established");

    let (mut client_read, mut client_write) = tokio::io::split(client_tls);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream_tls);

    // Requests already emitted, awaiting their response status, in wire order.
    let pending: Mutex<VecDeque<RequestRecord>> = Mutex::new(VecDeque::new());
    let mut sniffer = RequestSniffer::new(host, true, verbose);
    let mut scanner = ResponseScanner::new();

    let client_to_upstream = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = upstream_write.shutdown().await;
                    break;
                }
                Ok(n) => n,
            };
            // Forward before parsing; the sniffer never gates bytes.
            if upstream_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            for record in sniffer.push(&buf[..n]) {
                sink.emit(&record).await;
                pending.lock().await.push_back(record);
            }
        }
    };

    let upstream_to_client = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match upstream_read.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = client_write.shutdown().await;
                    break;
                }
                Ok(n) => n,
            };
            if client_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            for status in scanner.push(&buf[..n]) {
                if verbose {
                    info!(%host, code = status.code, reason = %status.reason, "←");
                }
                if let Some(mut record) = pending.lock().await.pop_front() {
                    let preview = if verbose { status.preview.clone() } else { None };
                    record.attach_response(status.code, preview);
                    sink.emit(&record).await;
                }
            }
        }
    };

    tokio::join!(client_to_upstream, upstream_to_client);
    debug!(%host, port, "mitm bridge closed");
    Ok(())
}
