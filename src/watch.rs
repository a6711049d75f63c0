// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Watch-list matching: which hosts get TLS interception.

use std::sync::{Arc, RwLock};

/// Operator-supplied substrings matched against hostnames.
///
/// A host is watched when any listed substring occurs in its lowercased
/// name. The list can be replaced at runtime; replacement publishes a whole
/// new list atomically, and every connection re-reads it, so the value a
/// record captured at creation stays stable for that record.
pub struct WatchList {
    domains: RwLock<Arc<Vec<String>>>,
}

impl WatchList {
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            domains: RwLock::new(Arc::new(normalize(domains))),
        }
    }

    /// True when at least one watch substring occurs in `host`.
    pub fn matches(&self, host: &str) -> bool {
        let domains = self.domains.read().unwrap().clone();
        let host = host.to_ascii_lowercase();
        domains.iter().any(|d| host.contains(d.as_str()))
    }

    /// Swap in a new list; connections in flight keep the value they read.
    pub fn replace(&self, domains: Vec<String>) {
        *self.domains.write().unwrap() = Arc::new(normalize(domains));
    }

    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.domains.read().unwrap().clone()
    }
}

fn normalize(domains: Vec<String>) -> Vec<String> {
    domains
        .into_iter()
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}
