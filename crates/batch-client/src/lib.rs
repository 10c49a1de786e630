//! A convenience layer over an HTTP agent for combining many independent
//! GET requests into one MIME-encoded batch request, and dispatching the
//! subresponses to each request's associated callback.

use log::{debug, info, trace, warn};

pub mod agent;
pub mod message;
pub mod multipart;
mod request;

pub use agent::{Cache, HttpAgent, MemoryCache};
pub use message::Response;
pub use request::{CallbackHandle, SubrequestSpec};

use multipart::MultipartMessage;
use request::Subrequest;

// The batch processor always lives at this path on the endpoint host,
// whatever path the configured endpoint URL carries.
const BATCH_PROCESSOR_PATH: &str = "/batch-processor";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("There's already an open batch request")]
    AlreadyOpen,

    #[error("There's no open batch request")]
    NotOpen,

    #[error("There's no batch processor endpoint to which to send a batch request")]
    NoEndpoint,

    #[error("URL has no host: {0}")]
    UrlWithoutHost(String),

    #[error("Received non-batch response: {status} {reason}")]
    NonBatchResponse { status: u16, reason: String },

    #[error("Batch response included {0}")]
    BadPart(&'static str),

    #[error("Could not decode a subresponse body")]
    CannotDecodeBody,

    #[error("Can't decode a multipart document: {0}")]
    Multipart(#[from] multipart::ParseError),

    #[error("Can't parse an HTTP message: {0}")]
    Message(#[from] message::ParseError),

    #[error("Error while calling the batch processor: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP malformed error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("Invalid URL: {0}")]
    Uri(#[from] hyper::http::uri::InvalidUri),
}

/// An ordered collection of subrequests to perform in a batch as one
/// HTTP request.
pub struct BatchRequest {
    requests: Vec<Subrequest>,
}

impl BatchRequest {
    fn new() -> BatchRequest {
        BatchRequest {
            requests: Vec::new(),
        }
    }

    /// Add a subrequest to the batch. The returned handle keeps the
    /// callback registered; if it is dropped before the batch completes,
    /// the subrequest is left out and `callback` is never invoked.
    pub fn add<F>(&mut self, spec: SubrequestSpec, callback: F) -> Result<CallbackHandle, Error>
    where
        F: FnMut(&str, &Response, &[u8]) + Send + 'static,
    {
        let uri: hyper::Uri = spec.url.parse()?;
        let host = uri
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| Error::UrlWithoutHost(spec.url.clone()))?;

        let (subrequest, handle) = Subrequest::new(spec, host, Box::new(callback));
        self.requests.push(subrequest);
        Ok(handle)
    }

    /// The number of subrequests that can still deliver their
    /// subresponses. Subrequests whose callback handle has been dropped
    /// don't count.
    pub fn len(&self) -> usize {
        self.requests.iter().filter(|r| r.alive()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the outbound multipart document. Subrequests whose callback
    /// is gone are skipped; the remaining parts get dense identifiers
    /// starting at 1, and the returned table maps each identifier back
    /// to the position of its subrequest.
    fn construct(&self, agent: &HttpAgent) -> Option<(MultipartMessage, Vec<usize>)> {
        if self.is_empty() {
            warn!("No requests were made for the batch");
            return None;
        }

        let mut message = MultipartMessage::new();
        let mut rendered = Vec::new();
        for (index, request) in self.requests.iter().enumerate() {
            match request.render(agent, rendered.len() + 1) {
                Some(part) => {
                    message.attach(part);
                    rendered.push(index);
                }
                None => trace!("skipping subrequest for {}, its callback is gone", request.url()),
            }
        }

        if message.is_empty() {
            warn!("No requests were made for the batch");
            return None;
        }
        Some((message, rendered))
    }

    async fn process(&self, agent: &HttpAgent, endpoint: &str) -> Result<(), Error> {
        let (message, rendered) = match self.construct(agent) {
            Some(constructed) => constructed,
            None => return Ok(()),
        };

        let headers = vec![
            ("content-type".to_string(), message.content_type()),
            ("mime-version".to_string(), "1.0".to_string()),
            // Prefer gzip on the batch response envelope.
            (
                "accept-encoding".to_string(),
                "gzip;q=1.0, identity; q=0.5, *;q=0".to_string(),
            ),
        ];

        let (status, headers, content) = agent
            .request(
                reqwest::Method::POST,
                &batch_url(endpoint)?,
                headers,
                Some(message.write()),
            )
            .await?;

        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        self.handle_response(
            agent,
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            content_type.as_deref(),
            &content,
            &rendered,
        )
    }

    /// Dispatch the subresponses of a batch response to the associated
    /// callbacks, in the order the parts appear in the response.
    fn handle_response(
        &self,
        agent: &HttpAgent,
        status: u16,
        reason: &str,
        content_type: Option<&str>,
        content: &[u8],
        rendered: &[usize],
    ) -> Result<(), Error> {
        if status != 207 {
            debug!(
                "Received non-batch response {} {} with content:\n{}",
                status,
                reason,
                String::from_utf8_lossy(content)
            );
            return Err(Error::NonBatchResponse {
                status,
                reason: reason.to_string(),
            });
        }

        let content_type = content_type.ok_or(multipart::ParseError::NotMultipart)?;
        let parts = multipart::parse(content_type, content)?;

        for part in parts {
            if part.content_type.essence_str() != "application/http-response" {
                return Err(Error::BadPart("a part that was not an HTTP response message"));
            }
            let id = part
                .request_id
                .as_deref()
                .ok_or(Error::BadPart("a part with no Multipart-Request-ID header"))?;
            let id: usize = id
                .trim()
                .parse()
                .map_err(|_| Error::BadPart("a part with an invalid Multipart-Request-ID header"))?;
            let index = id
                .checked_sub(1)
                .and_then(|i| rendered.get(i))
                .copied()
                .ok_or(Error::BadPart("a part with an unknown Multipart-Request-ID header"))?;

            self.requests[index].dispatch(agent, &part.payload)?;
        }

        Ok(())
    }
}

/// Sort of an HTTP client for performing batch HTTP requests.
///
/// At most one batch request is in flight per client: `open_batch`
/// starts one, `add` queues subrequests on it, and `complete_batch`
/// sends it off and dispatches the subresponses. `clear_batch` throws an
/// open batch away without performing it.
pub struct BatchClient {
    endpoint: Option<String>,
    agent: HttpAgent,
    batch: Option<BatchRequest>,
    opened_at: Option<&'static std::panic::Location<'static>>,
}

impl BatchClient {
    /// `endpoint` is the base URL of the site hosting the batch
    /// processor; the batch request goes to its `/batch-processor`
    /// resource. A client without an endpoint can open batches but not
    /// complete them.
    pub fn new(endpoint: Option<&str>) -> BatchClient {
        BatchClient {
            endpoint: endpoint.map(str::to_string),
            agent: HttpAgent::new(),
            batch: None,
            opened_at: None,
        }
    }

    pub fn agent(&self) -> &HttpAgent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut HttpAgent {
        &mut self.agent
    }

    pub fn batch(&self) -> Option<&BatchRequest> {
        self.batch.as_ref()
    }

    #[track_caller]
    pub fn open_batch(&mut self) -> Result<(), Error> {
        if self.batch.is_some() {
            if let Some(location) = self.opened_at {
                debug!("Batch request previously opened at {}", location);
            }
            return Err(Error::AlreadyOpen);
        }
        self.opened_at = Some(std::panic::Location::caller());
        self.batch = Some(BatchRequest::new());
        Ok(())
    }

    /// Add a subrequest to the open batch. See [`BatchRequest::add`].
    pub fn add<F>(&mut self, spec: SubrequestSpec, callback: F) -> Result<CallbackHandle, Error>
    where
        F: FnMut(&str, &Response, &[u8]) + Send + 'static,
    {
        match self.batch.as_mut() {
            Some(batch) => batch.add(spec, callback),
            None => Err(Error::NotOpen),
        }
    }

    /// Send the open batch and dispatch the subresponses. The batch is
    /// discarded whether or not this succeeds; a panic from a callback
    /// unwinds through here with the client back in its idle state.
    pub async fn complete_batch(&mut self) -> Result<(), Error> {
        if self.batch.is_none() {
            return Err(Error::NotOpen);
        }
        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => return Err(Error::NoEndpoint),
        };
        let batch = match self.batch.take() {
            Some(batch) => batch,
            None => return Err(Error::NotOpen),
        };
        self.opened_at = None;

        info!("Making batch request for {} items", batch.len());
        batch.process(&self.agent, &endpoint).await
    }

    /// Close the open batch without performing it. Closing an already
    /// closed batch is fine.
    pub fn clear_batch(&mut self) {
        self.batch = None;
        self.opened_at = None;
    }

    /// Scoped form of the open/add/complete cycle: the batch is
    /// completed when `build` returns `Ok` and cleared when it fails.
    pub async fn run_batch<F>(&mut self, build: F) -> Result<(), Error>
    where
        F: FnOnce(&mut BatchRequest) -> Result<(), Error>,
    {
        self.open_batch()?;
        let batch = match self.batch.as_mut() {
            Some(batch) => batch,
            None => return Err(Error::NotOpen),
        };
        match build(batch) {
            Ok(()) => self.complete_batch().await,
            Err(error) => {
                self.clear_batch();
                Err(error)
            }
        }
    }
}

fn batch_url(endpoint: &str) -> Result<String, Error> {
    let uri: hyper::Uri = endpoint.parse()?;
    let authority = uri
        .authority()
        .map(|a| a.to_string())
        .ok_or_else(|| Error::UrlWithoutHost(endpoint.to_string()))?;
    let scheme = uri.scheme_str().unwrap_or("http");
    Ok(format!("{}://{}{}", scheme, authority, BATCH_PROCESSOR_PATH))
}
