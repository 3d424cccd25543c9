//! src/services/source_client.rs
//!
//! SourceClient: authenticated HTTP access to an HCP namespace. One
//! `reqwest::Client` is built per run and shared by every crawler and
//! transfer worker; it carries connection pooling, the TLS policy and the
//! timeouts. Two request modes exist:
//!
//! - directory listings, returned as a raw byte stream for incremental
//!   decoding by the crawler;
//! - whole-object fetches with the annotation placed before the payload,
//!   returned as an [`ObjectDescriptor`] plus the remaining payload stream.

use crate::{
    errors::TransferError,
    models::{
        descriptor::{FetchedObject, ObjectDescriptor, PayloadStream},
        document::MetadataDocument,
    },
    services::latency::{LatencyAccumulator, PhaseTimings},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{StreamExt, future::BoxFuture, stream};
use reqwest::{
    RequestBuilder, Response, StatusCode, Url,
    dns::{Addrs, Name, Resolve, Resolving},
    header::{self, HeaderMap, HeaderName, HeaderValue},
};
use std::{
    collections::BTreeMap,
    fmt,
    io::{self, ErrorKind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tower::{Layer, Service};
use tracing::debug;

/// Object-only payload size of a whole-object response.
pub const HCP_SIZE: &str = "x-hcp-size";
/// Object content type as reported by HCP itself.
pub const HCP_CONTENT_TYPE: &str = "x-hcp-contenttype";
/// Error detail attached to non-200 responses.
pub const HCP_ERROR_MESSAGE: &str = "x-hcp-errormessage";
/// Ask for the annotation before the object payload.
pub const HCP_CUSTOM_METADATA_FIRST: &str = "x-hcp-custommetadatafirst";

/// Layout of `Last-Modified` values.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Largest annotation prefix read ahead of an object payload.
pub const MAX_ANNOTATION_LEN: u64 = 1024 * 1024;

/// Default prefix stripped from source paths to form destination keys.
pub const DEFAULT_STRIP_PREFIX: &str = "/rest/";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How a destination key is derived when an object has no annotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Remove a fixed protocol prefix (and any leading `/`) from the path.
    StripPrefix(String),
    /// Use the source path verbatim.
    Raw,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::StripPrefix(DEFAULT_STRIP_PREFIX.to_string())
    }
}

impl KeyPolicy {
    pub fn key_for(&self, path: &str) -> String {
        match self {
            Self::StripPrefix(prefix) => path
                .strip_prefix(prefix.as_str())
                .unwrap_or(path)
                .trim_start_matches('/')
                .to_string(),
            Self::Raw => path.to_string(),
        }
    }
}

/// Which header wins when both the standard and the HCP content-type
/// headers are present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContentTypePolicy {
    /// `Content-Type`, falling back to `X-HCP-ContentType`.
    #[default]
    PreferStandard,
    /// `X-HCP-ContentType`, falling back to `Content-Type`.
    PreferHcp,
}

impl ContentTypePolicy {
    fn resolve(self, headers: &HeaderMap) -> Option<String> {
        let standard = header_str(headers, header::CONTENT_TYPE.as_str());
        let hcp = header_str(headers, HCP_CONTENT_TYPE);
        let chosen = match self {
            Self::PreferStandard => standard.or(hcp),
            Self::PreferHcp => hcp.or(standard),
        };
        chosen.map(str::to_string)
    }
}

/// Everything needed to talk to one namespace.
#[derive(Clone)]
pub struct SourceConfig {
    /// Namespace REST root, e.g. `https://ns.tenant.hcp.example.com/rest`.
    pub namespace_url: Url,
    /// Value of the `Authorization` header.
    pub auth_token: String,
    /// Overrides the `Host` header for virtual-hosted routing.
    pub host_header: Option<String>,
    pub insecure: bool,
    pub key_policy: KeyPolicy,
    pub content_type_policy: ContentTypePolicy,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("namespace_url", &self.namespace_url.as_str())
            .field("auth_token", &"<redacted>")
            .field("host_header", &self.host_header)
            .field("insecure", &self.insecure)
            .field("key_policy", &self.key_policy)
            .field("content_type_policy", &self.content_type_policy)
            .finish()
    }
}

/// Build an HCP authorization token from a username and password:
/// `HCP base64(username):md5hex(password)`.
pub fn hcp_auth_token(username: &str, password: &str) -> String {
    format!(
        "HCP {}:{:x}",
        general_purpose::STANDARD.encode(username),
        md5::compute(password)
    )
}

/// Strip a leading `Host:` label some operators paste along with the value.
pub fn normalize_host_header(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.split_once(':') {
        Some((label, rest)) if label.eq_ignore_ascii_case("host") => rest.trim().to_string(),
        _ => trimmed.to_string(),
    }
}

tokio::task_local! {
    static REQUEST_PHASES: Arc<PhaseClock>;
}

/// Phase timings collected while a single request is in flight.
#[derive(Default)]
struct PhaseClock {
    dns_nanos: AtomicU64,
    /// Whole connector run: lookup, TCP connect and TLS handshake.
    establish_nanos: AtomicU64,
}

impl PhaseClock {
    fn timings(&self, ttfb: Duration) -> PhaseTimings {
        let dns = self.dns_nanos.load(Ordering::Relaxed);
        let establish = self.establish_nanos.load(Ordering::Relaxed);
        PhaseTimings {
            dns: Duration::from_nanos(dns),
            connect: Duration::from_nanos(establish.saturating_sub(dns)),
            ttfb,
        }
    }
}

fn elapsed_nanos(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// System resolver that reports lookup time to the request being served.
struct TimedResolver;

impl Resolve for TimedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let clock = REQUEST_PHASES.try_with(Arc::clone).ok();
        Box::pin(async move {
            let started = Instant::now();
            let resolved = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|err| Box::new(err) as BoxError)?;
            if let Some(clock) = clock {
                clock.dns_nanos.store(elapsed_nanos(started), Ordering::Relaxed);
            }
            let addrs: Addrs = Box::new(resolved.collect::<Vec<_>>().into_iter());
            Ok::<Addrs, BoxError>(addrs)
        })
    }
}

/// Times new connections for the request that opens them. Pooled
/// connections never reach the connector and report no connect time.
#[derive(Clone, Copy)]
struct ConnectTimingLayer;

impl<S> Layer<S> for ConnectTimingLayer {
    type Service = ConnectTiming<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnectTiming { inner }
    }
}

#[derive(Clone)]
struct ConnectTiming<S> {
    inner: S,
}

impl<S, Target> Service<Target> for ConnectTiming<S>
where
    S: Service<Target>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, target: Target) -> Self::Future {
        let clock = REQUEST_PHASES.try_with(Arc::clone).ok();
        let started = Instant::now();
        let connecting = self.inner.call(target);
        Box::pin(async move {
            let connected = connecting.await;
            if let Some(clock) = clock {
                clock
                    .establish_nanos
                    .store(elapsed_nanos(started), Ordering::Relaxed);
            }
            connected
        })
    }
}

/// Authenticated client for one source namespace.
pub struct SourceClient {
    http: reqwest::Client,
    namespace_url: Url,
    authorization: HeaderValue,
    host: Option<HeaderValue>,
    key_policy: KeyPolicy,
    content_type_policy: ContentTypePolicy,
    latency: Arc<LatencyAccumulator>,
}

impl SourceClient {
    /// Build the shared HTTP client for a namespace.
    pub fn new(config: SourceConfig) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(256)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .danger_accept_invalid_certs(config.insecure)
            .dns_resolver(Arc::new(TimedResolver))
            .connector_layer(ConnectTimingLayer)
            .build()
            .map_err(TransferError::Client)?;

        let mut authorization =
            HeaderValue::from_str(&config.auth_token).map_err(|_| TransferError::InvalidHeader {
                header: "Authorization",
                value: "<redacted>".into(),
            })?;
        authorization.set_sensitive(true);

        let host = config
            .host_header
            .as_deref()
            .map(normalize_host_header)
            .filter(|host| !host.is_empty())
            .map(|host| {
                HeaderValue::from_str(&host).map_err(|_| TransferError::InvalidHeader {
                    header: "Host",
                    value: host.clone(),
                })
            })
            .transpose()?;

        Ok(Self {
            http,
            namespace_url: config.namespace_url,
            authorization,
            host,
            key_policy: config.key_policy,
            content_type_policy: config.content_type_policy,
            latency: Arc::new(LatencyAccumulator::new()),
        })
    }

    pub fn namespace_url(&self) -> &Url {
        &self.namespace_url
    }

    pub fn latency(&self) -> &LatencyAccumulator {
        &self.latency
    }

    /// Request URL for a namespace path. The empty path is the namespace
    /// root itself.
    pub fn url_for(&self, path: &str) -> Url {
        let mut url = self.namespace_url.clone();
        if !path.is_empty() {
            url.set_path(path);
        }
        url
    }

    /// GET a directory listing. The caller decodes the stream.
    pub async fn fetch_listing(&self, path: &str) -> Result<PayloadStream, TransferError> {
        let url = self.url_for(path);
        let response = self.send(&url, self.request(url.clone())).await?;
        Ok(payload_stream(response))
    }

    /// GET a whole object, annotation first.
    ///
    /// When the response carries an annotation prefix it is read and
    /// decoded here; the returned body starts at the first payload byte.
    pub async fn fetch_object(
        &self,
        path: &str,
        annotation: Option<&str>,
    ) -> Result<FetchedObject, TransferError> {
        let mut url = self.url_for(path);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("type", "whole-object");
            if let Some(name) = annotation.filter(|name| !name.is_empty()) {
                query.append_pair("annotation", name);
            }
        }

        let request = self
            .request(url.clone())
            .header(HCP_CUSTOM_METADATA_FIRST, "true");
        let response = self.send(&url, request).await?;
        let headers = response.headers();

        let object_size =
            parse_size(headers, HCP_SIZE)?.ok_or(TransferError::MissingHeader("X-HCP-Size"))?;
        let total = parse_size(headers, header::CONTENT_LENGTH.as_str())?.unwrap_or(object_size);
        let annotation_len = annotation_length(total, object_size)?;

        let last_modified = header_str(headers, header::LAST_MODIFIED.as_str())
            .ok_or(TransferError::MissingHeader("Last-Modified"))
            .and_then(parse_http_date)?;
        let etag = header_str(headers, header::ETAG.as_str())
            .map(|tag| tag.trim_matches('"').to_string())
            .filter(|tag| !tag.is_empty());
        let content_type = self.content_type_policy.resolve(headers);

        let body = payload_stream(response);
        let (key, user_metadata, body) = if annotation_len > 0 {
            let len = usize::try_from(annotation_len).map_err(|_| TransferError::InvalidHeader {
                header: "Content-Length",
                value: total.to_string(),
            })?;
            let (prefix, rest) = read_prefix(body, len)
                .await
                .map_err(TransferError::Annotation)?;
            let document = MetadataDocument::decode(&prefix)?;
            (document.derive_key(), document.derive_metadata(), rest)
        } else {
            (self.key_policy.key_for(path), BTreeMap::new(), body)
        };

        Ok(FetchedObject {
            descriptor: ObjectDescriptor {
                key,
                source_path: path.to_string(),
                size: object_size,
                etag,
                last_modified,
                content_type,
                user_metadata,
            },
            body,
        })
    }

    fn request(&self, url: Url) -> RequestBuilder {
        let mut request = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.authorization.clone());
        if let Some(host) = &self.host {
            request = request.header(header::HOST, host.clone());
        }
        request
    }

    async fn send(&self, url: &Url, request: RequestBuilder) -> Result<Response, TransferError> {
        let clock = Arc::new(PhaseClock::default());
        let started = Instant::now();
        let result = REQUEST_PHASES
            .scope(Arc::clone(&clock), request.send())
            .await;
        self.latency.record(clock.timings(started.elapsed()));

        let response = result.map_err(|source| TransferError::Request {
            url: url.to_string(),
            source,
        })?;
        debug!(
            method = "GET",
            url = %url,
            status = %response.status(),
            headers = ?response.headers(),
            request = self.latency.requests(),
            "source request"
        );

        if response.status() != StatusCode::OK {
            return Err(TransferError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
                message: header_str(response.headers(), HCP_ERROR_MESSAGE).map(str::to_string),
            });
        }
        Ok(response)
    }
}

fn payload_stream(response: Response) -> PayloadStream {
    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_size(headers: &HeaderMap, name: &'static str) -> Result<Option<u64>, TransferError> {
    header_str(headers, name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|_| TransferError::InvalidHeader {
                    header: name,
                    value: raw.to_string(),
                })
        })
        .transpose()
}

/// Length of the annotation prefix of a whole-object response.
///
/// A total shorter than the object itself is a protocol error, and so is
/// a prefix longer than [`MAX_ANNOTATION_LEN`].
pub fn annotation_length(total: u64, object_size: u64) -> Result<u64, TransferError> {
    let length = total
        .checked_sub(object_size)
        .ok_or(TransferError::NegativeAnnotation { total, object_size })?;
    if length > MAX_ANNOTATION_LEN {
        return Err(TransferError::AnnotationTooLarge {
            length,
            limit: MAX_ANNOTATION_LEN,
        });
    }
    Ok(length)
}

/// Parse an HTTP date such as `Mon, 02 Jan 2006 15:04:05 GMT`.
pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>, TransferError> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| TransferError::InvalidHeader {
            header: "Last-Modified",
            value: value.to_string(),
        })
}

/// Split exactly `len` bytes off the front of a stream.
///
/// Any bytes of the last chunk beyond the prefix are put back in front of
/// the remaining stream; nothing else is buffered.
pub async fn read_prefix(
    mut stream: PayloadStream,
    len: usize,
) -> io::Result<(Bytes, PayloadStream)> {
    let mut prefix = BytesMut::with_capacity(len);
    let mut leftover = Bytes::new();

    while prefix.len() < len {
        let Some(chunk) = stream.next().await else {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("stream ended after {} of {len} bytes", prefix.len()),
            ));
        };
        let mut chunk = chunk?;
        let wanted = len - prefix.len();
        if chunk.len() > wanted {
            leftover = chunk.split_off(wanted);
        }
        prefix.extend_from_slice(&chunk);
    }

    let rest = if leftover.is_empty() {
        stream
    } else {
        stream::once(async move { Ok(leftover) }).chain(stream).boxed()
    };
    Ok((prefix.freeze(), rest))
}
