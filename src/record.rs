// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Observation records and the header container they carry.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum number of body bytes kept in a preview.
pub const PREVIEW_LIMIT: usize = 500;

/// Multi-map of HTTP header fields keyed by lowercased, trimmed field name.
///
/// Values for one name form a non-empty ordered sequence; callers that need
/// a single value take the first entry. Insertion order of names is kept so
/// forwarded requests look like what the client sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMultiMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMultiMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `name`. The name is trimmed and lowercased.
    pub fn append(&mut self, name: &str, value: &str) {
        let name = name.trim().to_ascii_lowercase();
        if let Some((_, values)) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            values.push(value.to_string());
        } else {
            self.entries.push((name, vec![value.to_string()]));
        }
    }

    /// First value recorded for `name`, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, values)| values.first().map(String::as_str))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Serialize for HeaderMultiMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            map.serialize_entry(name, &values.join(", "))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMultiMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapVisitor;

        impl<'de> Visitor<'de> for MapVisitor {
            type Value = HeaderMultiMap;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of header names to value strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut headers = HeaderMultiMap::new();
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    headers.append(&name, &value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

/// The structured summary of one observed request, later updated with its
/// response status.
///
/// Identity fields (`method`, `host`, `path`, `watched`, `timestamp`) are set
/// at creation and never change. `status_code` and `response_preview` are
/// attached at most once, after the record has already been emitted as a
/// request event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub timestamp: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub watched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderMultiMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_preview: Option<String>,
}

impl RequestRecord {
    pub fn new(method: &str, host: &str, path: &str, watched: bool) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            method: method.to_string(),
            host: host.to_ascii_lowercase(),
            path: path.to_string(),
            watched,
            headers: None,
            body_preview: None,
            status_code: None,
            response_preview: None,
        }
    }

    /// Attach the response status (and optional preview) once the upstream
    /// response is known. A second call is ignored.
    pub fn attach_response(&mut self, status_code: u16, response_preview: Option<String>) {
        if self.status_code.is_some() {
            return;
        }
        self.status_code = Some(status_code);
        self.response_preview = response_preview;
    }
}

/// Whether a method's request body gets a preview on watched records.
pub fn method_carries_preview(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH")
}

/// Preview of a request body: UTF-8 text truncated to [`PREVIEW_LIMIT`] bytes
/// with a trailing `"..."`, or the literal `<binary>` when decoding fails.
pub fn body_preview(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Err(_) => "<binary>".to_string(),
        Ok(s) if s.len() <= PREVIEW_LIMIT => s.to_string(),
        Ok(s) => {
            let mut end = PREVIEW_LIMIT;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        }
    }
}

/// Best-effort preview of a response body prefix. `None` when the prefix is
/// not decodable as UTF-8.
pub fn response_preview(body: &[u8]) -> Option<String> {
    let cut = body.len().min(PREVIEW_LIMIT);
    match std::str::from_utf8(&body[..cut]) {
        Ok(s) => Some(s.to_string()),
        // A multi-byte character split by the cut; keep the decodable part.
        Err(e) if e.valid_up_to() > 0 && cut < body.len() => {
            Some(String::from_utf8_lossy(&body[..e.valid_up_to()]).into_owned())
        }
        Err(_) => None,
    }
}
