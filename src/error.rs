// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error kinds for the proxy.

use thiserror::Error;

/// Failure categories of the proxy.
///
/// Only `Config`, `Crypto` and `PortInUse` are fatal, and only at startup.
/// Everything else is scoped to a single connection or a single sink write;
/// nothing a connection produces may terminate the accept loop.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("certificate authority failure: {0}")]
    Crypto(String),

    #[error("port {0} is already in use; stop the other listener or pass a different --listen-port")]
    PortInUse(u16),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Parse(String),

    #[error("upstream unreachable: {0}")]
    Upstream(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("observation sink error: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, Error>;
