//! A reverse proxy that fans batch requests out to an upstream server.
//!
//! One distinguished resource (`/batch-processor` by default) accepts a
//! multipart POST, forwards every embedded request to the upstream in
//! parallel, and answers `207 Multi-Status` with a multipart body that
//! holds the buffered upstream responses in the order the requests came
//! in. Every other path is relayed to the upstream untouched.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{App, Arg};
use futures::future::join_all;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use batch_client::message;
use batch_client::multipart::{self, MultipartMessage, Part};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// How long one upstream request may take before its slot in the batch
// response is given up as empty.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum BatchError {
    #[error("the request has no Content-Type header")]
    MissingContentType,

    #[error("can't read the request body: {0}")]
    Body(#[from] hyper::Error),

    #[error("can't parse the multipart body: {0}")]
    Multipart(#[from] multipart::ParseError),

    #[error("can't parse an embedded request: {0}")]
    Message(#[from] message::ParseError),
}

struct Configuration {
    listen: SocketAddr,
    upstream_host: String,
    upstream_port: u16,
    batch_path: String,
}

impl Configuration {
    fn from_args() -> Result<Configuration, String> {
        let matches = App::new("batch-proxy")
            .version(VERSION)
            .about("Fans multipart batch requests out to an upstream HTTP server")
            .arg(
                Arg::with_name("listen")
                    .default_value(":8080")
                    .help("Interface and port to listen on, as [iface][:port]"),
            )
            .arg(
                Arg::with_name("upstream")
                    .default_value("localhost:8000")
                    .help("Upstream server, as host[:port]"),
            )
            .arg(
                Arg::with_name("batch_path")
                    .long("batch-path")
                    .takes_value(true)
                    .default_value("batch-processor")
                    .help("Resource name that accepts batch requests"),
            )
            .get_matches();

        let listen = parse_listen(matches.value_of("listen").unwrap_or(":8080"))?;
        let (upstream_host, upstream_port) =
            parse_upstream(matches.value_of("upstream").unwrap_or("localhost:8000"))?;
        let batch_path = matches
            .value_of("batch_path")
            .unwrap_or("batch-processor")
            .trim_matches('/')
            .to_string();

        Ok(Configuration {
            listen,
            upstream_host,
            upstream_port,
            batch_path,
        })
    }
}

fn parse_listen(value: &str) -> Result<SocketAddr, String> {
    let mut parts = value.splitn(2, ':');
    let iface = match parts.next() {
        Some("") | None => "0.0.0.0",
        Some(iface) => iface,
    };
    let port = match parts.next() {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| format!("invalid listen port: {}", port))?,
        None => 8080,
    };

    let ip = iface
        .parse()
        .map_err(|_| format!("invalid listen interface: {}", iface))?;
    Ok(SocketAddr::new(ip, port))
}

fn parse_upstream(value: &str) -> Result<(String, u16), String> {
    let mut parts = value.splitn(2, ':');
    let host = match parts.next() {
        Some("") | None => "localhost",
        Some(host) => host,
    };
    let port = match parts.next() {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| format!("invalid upstream port: {}", port))?,
        None => 8000,
    };
    Ok((host.to_string(), port))
}

/// Split an inbound batch POST into the requests it carries, with
/// hop-by-hop headers removed and `X-Forwarded-Host` pointing back at
/// the host the batch was addressed to.
fn parse_batch_request(
    content_type: &str,
    inbound_host: Option<&str>,
    body: &[u8],
) -> Result<Vec<(Option<String>, message::Request)>, BatchError> {
    let mut requests = Vec::new();

    for part in multipart::parse(content_type, body)? {
        if part.content_type.essence_str() != "application/http-request" {
            debug!("ignoring batch part of type {}", part.content_type);
            continue;
        }

        let mut request = message::Request::parse(&part.payload)?;
        request.remove_header("connection");
        request.remove_header("proxy-connection");
        if let Some(host) = inbound_host {
            request.set_header("x-forwarded-host", host);
        }

        requests.push((part.request_id, request));
    }

    Ok(requests)
}

/// Send one request to the upstream over a dedicated connection and
/// buffer the raw response bytes until the upstream hangs up.
async fn forward(
    host: &str,
    port: u16,
    request: &message::Request,
) -> std::io::Result<Vec<u8>> {
    let mut request = request.clone();
    request.set_header("connection", "close");

    let mut stream = TcpStream::connect((host, port)).await?;
    stream.write_all(&request.write()).await?;

    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;
    Ok(buffer)
}

/// Issue every request concurrently and wait for all of them. A failed
/// or expired upstream request contributes whatever bytes it produced,
/// which may be none; it never sinks the batch.
async fn fan_out(
    host: &str,
    port: u16,
    requests: &[(Option<String>, message::Request)],
) -> Vec<Vec<u8>> {
    let forwards = requests.iter().map(|(_, request)| async move {
        match tokio::time::timeout(UPSTREAM_TIMEOUT, forward(host, port, request)).await {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(error)) => {
                warn!("upstream request for {} failed: {}", request.path, error);
                Vec::new()
            }
            Err(_) => {
                warn!("upstream request for {} timed out", request.path);
                Vec::new()
            }
        }
    });

    join_all(forwards).await
}

/// Assemble the `207 Multi-Status` reply: one part per request, in the
/// order the requests arrived, each tagged with the request's own ID.
fn render_batch(
    requests: &[(Option<String>, message::Request)],
    results: Vec<Vec<u8>>,
) -> Response<Body> {
    let mut message = MultipartMessage::new();
    for (index, ((request_id, _), buffer)) in requests.iter().zip(results).enumerate() {
        let id = match request_id {
            Some(id) => id.clone(),
            None => (index + 1).to_string(),
        };
        message.attach(Part::response(buffer, id));
    }

    let body = message.write();
    Response::builder()
        .status(StatusCode::MULTI_STATUS)
        .header("Date", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .header("Server", format!("batch-proxy/{}", VERSION))
        .header("Allow", "POST")
        .header("Content-Length", body.len())
        .header("Content-Type", message.content_type())
        .header("MIME-Version", "1.0")
        .body(Body::from(body))
        .unwrap()
}

async fn handle_batch(
    req: Request<Body>,
    cfg: &Configuration,
) -> Result<Response<Body>, BatchError> {
    if req.method() != hyper::Method::POST {
        return Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header("Allow", "POST")
            .body(Body::empty())
            .unwrap());
    }

    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or(BatchError::MissingContentType)?;
    let inbound_host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let body = hyper::body::to_bytes(req.into_body()).await?;
    let requests = parse_batch_request(&content_type, inbound_host.as_deref(), &body)?;

    info!("fanning out a batch of {} requests", requests.len());
    let results = fan_out(&cfg.upstream_host, cfg.upstream_port, &requests).await;

    Ok(render_batch(&requests, results))
}

/// Relay a non-batch request to the upstream as a plain reverse proxy.
async fn passthrough(
    mut req: Request<Body>,
    cfg: &Configuration,
    client: &hyper::Client<hyper::client::HttpConnector>,
) -> Result<Response<Body>, hyper::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let upstream = format!(
        "http://{}:{}{}",
        cfg.upstream_host, cfg.upstream_port, path_and_query
    );

    let inbound_host = req
        .headers()
        .get(hyper::header::HOST)
        .cloned();

    match upstream.parse() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(error) => {
            error!("can't build upstream URI from {}: {}", path_and_query, error);
            return Ok(Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::empty())
                .unwrap());
        }
    }
    if let Some(host) = inbound_host {
        req.headers_mut().insert("x-forwarded-host", host);
    }
    req.headers_mut().remove(hyper::header::HOST);

    client.request(req).await
}

async fn http_handler(
    req: Request<Body>,
    cfg: Arc<Configuration>,
    client: hyper::Client<hyper::client::HttpConnector>,
) -> Result<Response<Body>, Infallible> {
    let is_batch = req.uri().path().trim_matches('/') == cfg.batch_path;

    let response = if is_batch {
        match handle_batch(req, &cfg).await {
            Ok(response) => response,
            Err(error) => {
                warn!("rejecting batch request: {}", error);
                Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Body::from(format!("{}\n", error)))
                    .unwrap()
            }
        }
    } else {
        match passthrough(req, &cfg, &client).await {
            Ok(response) => response,
            Err(error) => {
                error!("upstream request failed: {}", error);
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(Body::empty())
                    .unwrap()
            }
        }
    };

    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let configuration = match Configuration::from_args() {
        Ok(configuration) => configuration,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
    };
    let configuration = Arc::new(configuration);
    let client = hyper::Client::new();

    let make_svc = make_service_fn(|_conn| {
        let configuration = Arc::clone(&configuration);
        let client = client.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                http_handler(req, Arc::clone(&configuration), client.clone())
            }))
        }
    });

    let addr = configuration.listen;
    let server = Server::bind(&addr).serve(make_svc);

    info!(
        "Listening on http://{}, forwarding to {}:{}",
        addr, configuration.upstream_host, configuration.upstream_port
    );

    server.await?;

    Ok(())
}
