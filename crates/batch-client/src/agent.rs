//! The HTTP agent behind the batch client: a `reqwest` transport plus
//! the cache and authorization state that individual subrequests pick up
//! without performing any network I/O of their own.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use log::{debug, trace, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::message::Response;
use crate::request::SubrequestSpec;
use crate::Error;

/// Backing store for cached responses, keyed by request URL. Records
/// are the raw printed response: status line, headers, blank line, body.
pub trait Cache: Send + Sync {
    fn get(&self, url: &str) -> Option<Vec<u8>>;
    fn set(&self, url: &str, record: Vec<u8>);
    fn delete(&self, url: &str);
}

/// A `Cache` that lives entirely in memory.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Cache for MemoryCache {
    fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(url).cloned())
    }

    fn set(&self, url: &str, record: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.to_string(), record);
        }
    }

    fn delete(&self, url: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(url);
        }
    }
}

/// Basic credentials for one host.
#[derive(Debug, Clone)]
pub struct Credentials {
    host: String,
    username: String,
    password: String,
}

pub struct HttpAgent {
    http: reqwest::Client,
    cache: Option<Box<dyn Cache>>,
    authorizations: Vec<Credentials>,
}

impl HttpAgent {
    pub fn new() -> HttpAgent {
        HttpAgent {
            http: reqwest::Client::new(),
            cache: None,
            authorizations: Vec::new(),
        }
    }

    pub fn set_cache(&mut self, cache: Box<dyn Cache>) {
        self.cache = Some(cache);
    }

    pub fn cache(&self) -> Option<&dyn Cache> {
        self.cache.as_deref()
    }

    pub fn add_credentials(&mut self, host: &str, username: &str, password: &str) {
        self.authorizations.push(Credentials {
            host: host.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    pub fn clear_credentials(&mut self) {
        self.authorizations.clear();
    }

    /// With neither a cache nor authorizations there is nothing for the
    /// agent to contribute, and subrequests pass through untouched.
    fn is_passive(&self) -> bool {
        self.cache.is_none() && self.authorizations.is_empty()
    }

    /// Dry run of a subrequest: compute the headers and body the agent
    /// would put on the wire for `spec`, picking up cache validators and
    /// authorization state, without any network I/O.
    pub fn prepare(&self, spec: &SubrequestSpec) -> (Vec<(String, String)>, Option<Vec<u8>>) {
        let mut headers = spec.headers.clone();
        if self.is_passive() {
            return (headers, spec.body.clone());
        }

        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get(&spec.url) {
                match Response::parse(&record) {
                    Ok((cached, _)) => {
                        if let Some(etag) = cached.header("etag") {
                            crate::message::set_header(&mut headers, "if-none-match", etag);
                        }
                        if let Some(modified) = cached.header("last-modified") {
                            crate::message::set_header(&mut headers, "if-modified-since", modified);
                        }
                    }
                    Err(error) => {
                        warn!("dropping unreadable cache record for {}: {}", spec.url, error);
                        cache.delete(&spec.url);
                    }
                }
            }
        }

        if let Some(host) = spec.host() {
            for credentials in &self.authorizations {
                if credentials.host == host {
                    let token =
                        base64::encode(format!("{}:{}", credentials.username, credentials.password));
                    crate::message::set_header(&mut headers, "authorization", &format!("Basic {}", token));
                    break;
                }
            }
        }

        (headers, spec.body.clone())
    }

    /// Run a decoded subresponse back through the agent's state: undo
    /// content encodings, resolve `304 Not Modified` against the cache
    /// (the caller sees a 200 with the cached body), and refresh the
    /// cache record.
    pub fn postprocess(
        &self,
        url: &str,
        response: &mut Response,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        if self.is_passive() {
            return Ok(body);
        }

        let body = decompress(response, body)?;

        if response.status == 304 {
            let cached = self
                .cache
                .as_ref()
                .and_then(|cache| cache.get(url))
                .as_deref()
                .map(Response::parse)
                .transpose()
                .ok()
                .flatten();
            let (mut record, cached_body) = match cached {
                Some(entry) => entry,
                None => {
                    // Nothing to revalidate against; the subresponse has
                    // no usable body.
                    return Err(Error::CannotDecodeBody);
                }
            };

            // Fold the fresh validators into the stored record before
            // rewriting the status for the caller.
            for (name, value) in &response.headers {
                record.set_header(name, value);
            }
            record.status = 304;
            record.reason = response.reason.clone();
            if let Some(cache) = &self.cache {
                cache.set(url, record.write(&cached_body));
            }

            response.status = 200;
            return Ok(cached_body.to_vec());
        }

        if response.status == 200 {
            if let Some(cache) = &self.cache {
                cache.set(url, response.write(&body));
            }
        }

        Ok(body)
    }

    /// Perform a plain HTTP request, buffering the entire response.
    pub async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Result<(reqwest::StatusCode, HeaderMap, Bytes), Error> {
        debug!(
            target: "batch_client::request",
            "Making request:\n{} {}\n{}\n\n{}",
            method,
            url,
            headers
                .iter()
                .map(|(name, value)| format!("{}: {}", name, value))
                .collect::<Vec<_>>()
                .join("\n"),
            body.as_deref().map(String::from_utf8_lossy).unwrap_or_default(),
        );

        let mut header_map = HeaderMap::new();
        for (name, value) in &headers {
            let name: HeaderName = name.parse().map_err(hyper::http::Error::from)?;
            let value: HeaderValue = value.parse().map_err(hyper::http::Error::from)?;
            header_map.append(name, value);
        }

        let mut builder = self.http.request(method, url).headers(header_map);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let content = response.bytes().await?;

        debug!(
            target: "batch_client::response",
            "Got response:\n{}\n\n{}",
            headers
                .iter()
                .map(|(name, value)| format!("{}: {:?}", name, value))
                .collect::<Vec<_>>()
                .join("\n"),
            String::from_utf8_lossy(&content),
        );

        Ok((status, headers, content))
    }
}

/// Undo a `Content-Encoding` the origin applied anyway. Subrequests ask
/// for identity, but not every server honors that.
fn decompress(response: &mut Response, body: Vec<u8>) -> Result<Vec<u8>, Error> {
    let encoding = match response.header("content-encoding") {
        Some(encoding) => encoding.to_ascii_lowercase(),
        None => return Ok(body),
    };

    let mut decoded = Vec::new();
    let result = match encoding.as_str() {
        "gzip" => GzDecoder::new(&body[..]).read_to_end(&mut decoded),
        "deflate" => ZlibDecoder::new(&body[..]).read_to_end(&mut decoded),
        _ => return Ok(body),
    };

    match result {
        Ok(_) => {
            trace!("decoded {} byte {} body", decoded.len(), encoding);
            response.remove_header("content-encoding");
            Ok(decoded)
        }
        Err(_) => Err(Error::CannotDecodeBody),
    }
}
