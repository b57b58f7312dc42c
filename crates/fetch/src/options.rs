use {
    bytes::Bytes,
    reqwest::{Method, StatusCode, header::HeaderMap},
    serde::de::DeserializeOwned,
};

use crate::error::FetchError;

/// Per-call knobs. Build with struct update syntax:
///
/// ```
/// use switchboard_fetch::FetchOptions;
///
/// let opts = FetchOptions {
///     timeout_ms: 5_000,
///     retries: 0,
///     ..Default::default()
/// };
/// assert!(!opts.skip_dedup);
/// ```
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Deadline for a single attempt.
    pub timeout_ms: u64,
    /// Additional attempts after the first.
    pub retries: u32,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Always issue a fresh call, even if an identical GET is in flight.
    pub skip_dedup: bool,
    /// Enables the read-through response cache when positive.
    pub cache_ttl_ms: Option<u64>,
    /// Bypass a fresh cache entry; the entry is still refreshed on success.
    pub skip_cache: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retries: 1,
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            skip_dedup: false,
            cache_ttl_ms: None,
            skip_cache: false,
        }
    }
}

impl FetchOptions {
    /// Set a header, replacing any existing value with the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }
}

/// Request payload. Multipart bodies are rebuilt for every attempt.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Text(String),
    Multipart(Vec<MultipartField>),
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// One field of a multipart form.
#[derive(Debug, Clone)]
pub struct MultipartField {
    pub name: String,
    pub value: MultipartValue,
}

#[derive(Debug, Clone)]
pub enum MultipartValue {
    Text(String),
    File {
        file_name: String,
        mime: Option<String>,
        data: Bytes,
    },
}

impl MultipartField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: MultipartValue::Text(value.into()),
        }
    }

    pub fn file(name: impl Into<String>, file_name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            value: MultipartValue::File {
                file_name: file_name.into(),
                mime: None,
                data,
            },
        }
    }
}

pub(crate) fn build_form(fields: &[MultipartField]) -> Result<reqwest::multipart::Form, FetchError> {
    let mut form = reqwest::multipart::Form::new();
    for field in fields {
        form = match &field.value {
            MultipartValue::Text(v) => form.text(field.name.clone(), v.clone()),
            MultipartValue::File {
                file_name,
                mime,
                data,
            } => {
                let mut part =
                    reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name.clone());
                if let Some(mime) = mime {
                    part = part.mime_str(mime)?;
                }
                form.part(field.name.clone(), part)
            },
        };
    }
    Ok(form)
}

/// A fully buffered 2xx response.
///
/// Buffered so one result can be handed to every deduplicated caller.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Body as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON; `url` is used for error context.
    pub fn json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::JsonParse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}
