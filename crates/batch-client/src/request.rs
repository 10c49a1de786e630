use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::agent::HttpAgent;
use crate::message::{self, Response};
use crate::multipart::Part;
use crate::Error;

/// The signature subresponse callbacks must have: the original
/// subrequest URL, the parsed subresponse head, and the response body.
pub type CallbackFn = dyn FnMut(&str, &Response, &[u8]) + Send;

/// Keeps a subrequest's callback reachable.
///
/// Adding a subrequest to a batch hands one of these back, and the
/// subrequest stays in the batch only as long as its handle is held.
/// Dropping the handle tells the batch nobody is interested in the
/// subresponse anymore: the subrequest is left out of the wire request
/// and the callback is never invoked.
pub struct CallbackHandle {
    _callback: Arc<Mutex<Box<CallbackFn>>>,
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").finish()
    }
}

struct WeakCallback {
    callback: Weak<Mutex<Box<CallbackFn>>>,
}

impl WeakCallback {
    fn new(callback: Box<CallbackFn>) -> (WeakCallback, CallbackHandle) {
        let strong = Arc::new(Mutex::new(callback));
        let weak = WeakCallback {
            callback: Arc::downgrade(&strong),
        };
        (weak, CallbackHandle { _callback: strong })
    }

    fn alive(&self) -> bool {
        self.callback.strong_count() > 0
    }

    fn upgrade(&self) -> Option<Arc<Mutex<Box<CallbackFn>>>> {
        self.callback.upgrade()
    }
}

/// The description of one logical HTTP call to fold into a batch.
/// Header names are stored lowercased; the spec is immutable once it
/// has been added to a batch.
#[derive(Debug, Clone)]
pub struct SubrequestSpec {
    pub(crate) url: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<Vec<u8>>,
}

impl SubrequestSpec {
    pub fn get(url: &str) -> SubrequestSpec {
        SubrequestSpec {
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> SubrequestSpec {
        message::set_header(&mut self.headers, name, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> SubrequestSpec {
        self.body = Some(body);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn host(&self) -> Option<String> {
        self.url
            .parse::<hyper::Uri>()
            .ok()
            .and_then(|uri| uri.authority().map(|a| a.to_string()))
    }
}

/// A subrequest of a batched HTTP request: the call description, the
/// URL's authority, and a weak reference to the consumer of its result.
pub(crate) struct Subrequest {
    spec: SubrequestSpec,
    host: String,
    callback: WeakCallback,
}

impl Subrequest {
    pub(crate) fn new(
        spec: SubrequestSpec,
        host: String,
        callback: Box<CallbackFn>,
    ) -> (Subrequest, CallbackHandle) {
        let (callback, handle) = WeakCallback::new(callback);
        (
            Subrequest {
                spec,
                host,
                callback,
            },
            handle,
        )
    }

    pub(crate) fn alive(&self) -> bool {
        self.callback.alive()
    }

    pub(crate) fn url(&self) -> &str {
        &self.spec.url
    }

    /// Render this subrequest as a multipart part carrying a full HTTP
    /// request, after a dry run through the agent for cache validators
    /// and authorization headers. Returns `None` when nobody holds the
    /// callback handle anymore.
    pub(crate) fn render(&self, agent: &HttpAgent, id: usize) -> Option<Part> {
        if !self.callback.alive() {
            return None;
        }

        let (mut headers, body) = agent.prepare(&self.spec);

        message::set_header(&mut headers, "host", &self.host);
        // Compression is unlikely to survive batching.
        message::set_header(&mut headers, "accept-encoding", "identity");

        // The whole URL goes on the request line, the convention for
        // requests relayed through a proxy.
        let mut text = format!("GET {} HTTP/1.1\r\n", self.spec.url);
        for (name, value) in &headers {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
        text.push_str("\r\n");

        let mut payload = text.into_bytes();
        if let Some(body) = body {
            payload.extend(body);
        }

        Some(Part::request(payload, id))
    }

    /// Decode a subresponse payload and hand it to the callback. A
    /// dropped callback is a silent skip, never an error.
    pub(crate) fn dispatch(&self, agent: &HttpAgent, payload: &[u8]) -> Result<(), Error> {
        let callback = match self.callback.upgrade() {
            Some(callback) => callback,
            None => {
                trace!("no callback to return the response for {} to", self.spec.url);
                return Ok(());
            }
        };

        let (mut response, body) = Response::parse(payload)?;
        let body = agent.postprocess(&self.spec.url, &mut response, body.to_vec())?;

        let mut callback = match callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (&mut *callback)(&self.spec.url, &response, &body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subrequest(spec: SubrequestSpec) -> (Subrequest, CallbackHandle) {
        let host = spec.host().unwrap();
        Subrequest::new(spec, host, Box::new(|_, _, _| {}))
    }

    #[test]
    fn test_render_passes_headers_through() {
        let agent = HttpAgent::new();
        let spec = SubrequestSpec::get("http://example.com/moose").header("X-Custom", "yes");
        let (request, _handle) = subrequest(spec);

        let part = request.render(&agent, 1).expect("callback is alive");
        let written = {
            let mut message = crate::multipart::MultipartMessage::new();
            message.attach(part);
            String::from_utf8(message.write()).unwrap()
        };

        assert!(written.contains("GET http://example.com/moose HTTP/1.1=0D"));
        assert!(written.contains("x-custom: yes=0D"));
        assert!(written.contains("host: example.com=0D"));
        assert!(written.contains("accept-encoding: identity=0D"));
    }

    #[test]
    fn test_render_skips_dropped_callback() {
        let agent = HttpAgent::new();
        let (request, handle) = subrequest(SubrequestSpec::get("http://example.com/moose"));

        assert!(request.alive());
        drop(handle);
        assert!(!request.alive());
        assert!(request.render(&agent, 1).is_none());
    }

    #[test]
    fn test_dispatch_after_drop_is_silent() {
        let agent = HttpAgent::new();
        let (request, handle) = subrequest(SubrequestSpec::get("http://example.com/moose"));
        drop(handle);

        request
            .dispatch(&agent, b"HTTP/1.1 200 OK\r\n\r\nnobody's listening")
            .expect("dropped callback is not an error");
    }
}
