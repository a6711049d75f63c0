// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::sleep;

use roo_sniffer::proxy::{run_proxy, ProxyState};
use roo_sniffer::{CertificateAuthority, Config, ObservationSink, RequestRecord, WatchList};

pub struct TestProxy {
    pub handle: tokio::task::JoinHandle<()>,
    pub addr: SocketAddr,
    pub log_path: PathBuf,
    pub cert_dir: PathBuf,
}

impl TestProxy {
    /// Records written so far, in file order.
    pub async fn records(&self) -> Vec<RequestRecord> {
        let Ok(s) = tokio::fs::read_to_string(&self.log_path).await else {
            return Vec::new();
        };
        s.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Poll the log file until at least `n` records exist. The deadline is
    /// generous because debug-mode RSA key generation is slow.
    pub async fn wait_for_records(&self, n: usize) -> Vec<RequestRecord> {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let records = self.records().await;
            if records.len() >= n {
                return records;
            }
            if Instant::now() > deadline {
                panic!("timeout waiting for {n} records, have {}", records.len());
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn cleanup(self) {
        self.handle.abort();
        let _ = self.handle.await;
        let _ = tokio::fs::remove_file(&self.log_path).await;
        let _ = tokio::fs::remove_dir_all(&self.cert_dir).await;
    }
}

/// Start a proxy with the given watch list and wait until it accepts.
pub async fn start_proxy_and_wait(
    watch_domains: Vec<String>,
    verbose: bool,
) -> anyhow::Result<TestProxy> {
    let id = uuid::Uuid::new_v4();
    let log_path = std::env::temp_dir().join(format!("sniffer_integ_{id}.jsonl"));
    let cert_dir = std::env::temp_dir().join(format!("sniffer_integ_certs_{id}"));

    start_proxy_and_wait_with_dirs(watch_domains, verbose, log_path, cert_dir).await
}

/// Same, with caller-chosen log and cert locations (for restart tests).
pub async fn start_proxy_and_wait_with_dirs(
    watch_domains: Vec<String>,
    verbose: bool,
    log_path: PathBuf,
    cert_dir: PathBuf,
) -> anyhow::Result<TestProxy> {
    let cfg = Config {
        listen_port: 0,
        log_path: log_path.to_string_lossy().to_string(),
        watch_domains: watch_domains.clone(),
        verbose,
        cert_dir: cert_dir.to_string_lossy().to_string(),
    };

    let ca = CertificateAuthority::load_or_init(&cert_dir).await?;
    let sink = ObservationSink::new(cfg.log_path.clone()).await?;
    let watch = Arc::new(WatchList::new(watch_domains));

    // Choose a free port by binding then dropping.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let state = ProxyState::new(Arc::new(cfg), watch, ca, sink);
    let handle = tokio::spawn(async move {
        let _ = run_proxy(addr, state).await;
    });

    // Wait for the server to accept connections.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            anyhow::bail!("timeout waiting for proxy to start");
        }
        if let Ok(mut s) = tokio::net::TcpStream::connect(addr).await {
            let _ = s.shutdown().await;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    Ok(TestProxy {
        handle,
        addr,
        log_path,
        cert_dir,
    })
}

// ---------------------------------------------------------------------------
// TLS helpers for the interception tests.

/// Accepts any certificate; the interception tests pin trust elsewhere.
struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[allow(dead_code)]
pub fn insecure_tls_client_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth(),
    )
}

/// Start a toy TLS origin that reads `request_count` HTTP requests, then
/// writes `response` and closes. The plaintext it received comes back
/// through the returned channel.
#[allow(dead_code)]
pub async fn start_toy_tls_server(
    request_count: usize,
    response: Vec<u8>,
) -> anyhow::Result<(u16, oneshot::Receiver<Vec<u8>>)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(cert.serialize_der()?)],
            rustls::PrivateKey(cert.serialize_private_key_der()),
        )?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut tls) = acceptor.accept(socket).await else {
            return;
        };

        let mut buf = Vec::new();
        let mut tmp = [0u8; 8192];
        while count_complete_requests(&buf) < request_count {
            match tls.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        }
        let _ = tls.write_all(&response).await;
        let _ = tls.flush().await;
        let _ = tls.shutdown().await;
        let _ = tx.send(buf);
    });

    Ok((port, rx))
}

/// Content-Length-aware count of complete requests in `buf`.
#[allow(dead_code)]
fn count_complete_requests(buf: &[u8]) -> usize {
    let mut count = 0;
    let mut rest = buf;
    loop {
        let Some(pos) = rest.windows(4).position(|w| w == b"\r\n\r\n") else {
            return count;
        };
        let head = String::from_utf8_lossy(&rest[..pos]);
        let content_length: usize = head
            .split("\r\n")
            .filter_map(|l| l.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
            .unwrap_or(0);
        let total = pos + 4 + content_length;
        if rest.len() < total {
            return count;
        }
        count += 1;
        rest = &rest[total..];
    }
}

/// CONNECT through the proxy, then upgrade the socket to TLS as a client
/// that trusts anything (leaf identity is asserted in the CA unit tests).
#[allow(dead_code)]
pub async fn connect_mitm(
    proxy_addr: SocketAddr,
    host: &str,
    port: u16,
) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let mut hdr = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(60), stream.read(&mut tmp)).await??;
        if n == 0 {
            anyhow::bail!("unexpected EOF reading CONNECT response");
        }
        hdr.extend_from_slice(&tmp[..n]);
        if hdr.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let hdrs = String::from_utf8_lossy(&hdr);
    anyhow::ensure!(
        hdrs.starts_with("HTTP/1.1 200"),
        "CONNECT rejected: {hdrs}"
    );

    let connector = tokio_rustls::TlsConnector::from(insecure_tls_client_config());
    let server_name = rustls::ServerName::try_from(host)?;
    Ok(connector.connect(server_name, stream).await?)
}
