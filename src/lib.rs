// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP/HTTPS forward proxy that records API traffic.
//!
//! The proxy forwards plain HTTP, tunnels CONNECT targets opaquely, and
//! performs TLS interception for hosts on the watch list using a private
//! CA, emitting a structured record per observed request.

pub mod ca;
pub mod config;
pub mod error;
pub mod mitm;
pub mod proxy;
pub mod record;
pub mod sink;
pub mod sniff;
pub mod stream;
pub mod tunnel;
pub mod watch;

pub use ca::CertificateAuthority;
pub use config::Config;
pub use error::{Error, Result};
pub use record::RequestRecord;
pub use sink::ObservationSink;
pub use watch::WatchList;

// main.rs remains the binary entrypoint.
