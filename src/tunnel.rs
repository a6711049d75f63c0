// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Opaque TCP tunneling for non-watched CONNECT targets.

use crate::error::{Error, Result};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Splice bytes both ways between an established client connection and
/// `host:port` until either side closes, then close the other.
///
/// The payload is deliberately opaque: nothing inside the tunnel is parsed.
/// The caller has already acknowledged the tunnel with a 200, so an upstream
/// connect failure surfaces to the client as a plain close.
pub async fn splice<S>(mut client: S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Upstream(format!("cannot reach {host}:{port}: {e}")))?;

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((from_client, from_upstream)) => {
            debug!(%host, port, from_client, from_upstream, "tunnel closed");
            Ok(())
        }
        // Peers tearing a tunnel down mid-splice is a normal ending.
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
            ) =>
        {
            debug!(%host, port, %e, "tunnel torn down");
            Ok(())
        }
        Err(e) => Err(Error::Transport(e)),
    }
}
