// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

mod common;
use common::{connect_mitm, start_proxy_and_wait_with_dirs, start_toy_tls_server};

#[tokio::test]
async fn restart_reuses_ca_byte_for_byte() -> anyhow::Result<()> {
    let id = uuid::Uuid::new_v4();
    let log_path = std::env::temp_dir().join(format!("sniffer_persist_{id}.jsonl"));
    let cert_dir = std::env::temp_dir().join(format!("sniffer_persist_certs_{id}"));

    // First run: fresh cert dir, one intercepted request.
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
    let (port, _received) = start_toy_tls_server(1, response.clone()).await?;

    let proxy = start_proxy_and_wait_with_dirs(
        vec!["127.0.0.1".into()],
        false,
        log_path.clone(),
        cert_dir.clone(),
    )
    .await?;

    let mut tls = connect_mitm(proxy.addr, "127.0.0.1", port).await?;
    tls.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await?;
    tls.flush().await?;
    let mut reply = Vec::new();
    timeout(Duration::from_secs(60), tls.read_to_end(&mut reply)).await??;

    let ca_pem_path = cert_dir.join("roo-sniffer-ca.pem");
    let pem_before = tokio::fs::read(&ca_pem_path).await?;
    assert!(!pem_before.is_empty());

    // Stop without touching the cert dir.
    proxy.handle.abort();
    let _ = proxy.handle.await;

    // Second run over the same cert dir: the PEM bytes must be unchanged
    // and interception must still work.
    let (port2, _received2) = start_toy_tls_server(1, response).await?;
    let proxy2 = start_proxy_and_wait_with_dirs(
        vec!["127.0.0.1".into()],
        false,
        log_path.clone(),
        cert_dir.clone(),
    )
    .await?;

    let pem_after = tokio::fs::read(&ca_pem_path).await?;
    assert_eq!(pem_before, pem_after);

    let mut tls = connect_mitm(proxy2.addr, "127.0.0.1", port2).await?;
    tls.write_all(b"GET /again HTTP/1.1\r\nHost: x\r\n\r\n")
        .await?;
    tls.flush().await?;
    let mut reply = Vec::new();
    timeout(Duration::from_secs(60), tls.read_to_end(&mut reply)).await??;
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 200"));

    let pem_final = tokio::fs::read(&ca_pem_path).await?;
    assert_eq!(pem_before, pem_final);

    proxy2.cleanup().await;
    Ok(())
}
