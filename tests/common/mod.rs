//! Shared fixtures: an in-process mock HCP namespace served with axum and
//! an in-memory destination that records every call.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::Response,
};
use bytes::Bytes;
use futures::TryStreamExt;
use hcp_migrate::{
    errors::DestinationError,
    models::descriptor::{ObjectDescriptor, PayloadStream},
    services::{
        destination::Destination,
        source_client::{ContentTypePolicy, KeyPolicy, SourceClient, SourceConfig},
    },
};
use reqwest::Url;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::sync::Notify;

pub const TOKEN: &str = "HCP bXl1c2Vy:5f4dcc3b5aa765d61d8327deb882cf99";
pub const LAST_MODIFIED: &str = "Thu, 04 Mar 2021 10:11:12 GMT";

/// One stored object on the mock namespace.
#[derive(Clone, Debug, Default)]
pub struct MockObject {
    pub payload: Vec<u8>,
    /// Annotation document served before the payload when requested.
    pub annotation: Option<Vec<u8>>,
    /// Replaces the computed `X-HCP-Size` header.
    pub size_header: Option<String>,
    pub content_type: Option<String>,
    /// Send the body chunked, without `Content-Length`.
    pub chunked: bool,
}

impl MockObject {
    pub fn plain(payload: &[u8]) -> Self {
        Self {
            payload: payload.to_vec(),
            content_type: Some("application/octet-stream".into()),
            ..Self::default()
        }
    }

    pub fn annotated(payload: &[u8], annotation: &str) -> Self {
        Self {
            annotation: Some(annotation.as_bytes().to_vec()),
            ..Self::plain(payload)
        }
    }
}

#[derive(Default)]
pub struct MockState {
    listings: Mutex<HashMap<String, String>>,
    objects: Mutex<HashMap<String, MockObject>>,
    /// Request paths in arrival order, query included.
    pub requests: Mutex<Vec<String>>,
}

impl MockState {
    pub fn add_listing(&self, path: &str, body: String) {
        self.listings
            .lock()
            .unwrap()
            .insert(path.to_string(), body);
    }

    pub fn add_object(&self, path: &str, object: MockObject) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), object);
    }

    pub fn requests_for(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.split('?').next() == Some(path))
            .count()
    }
}

/// A running mock namespace.
pub struct MockHcp {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockHcp {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .fallback(serve)
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn namespace_url(&self) -> Url {
        Url::parse(&format!("http://{}/rest", self.addr)).unwrap()
    }

    pub fn client(&self) -> Arc<SourceClient> {
        self.client_with_token(TOKEN)
    }

    pub fn client_with_token(&self, token: &str) -> Arc<SourceClient> {
        Arc::new(
            SourceClient::new(SourceConfig {
                namespace_url: self.namespace_url(),
                auth_token: token.to_string(),
                host_header: Some("HOST:ns1.tenant.hcp.example.com".into()),
                insecure: false,
                key_policy: KeyPolicy::default(),
                content_type_policy: ContentTypePolicy::default(),
            })
            .unwrap(),
        )
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header("X-HCP-ErrorMessage", message)
        .body(Body::empty())
        .unwrap()
}

async fn serve(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();
    let request = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.clone(),
    };
    state.requests.lock().unwrap().push(request);

    if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some(TOKEN) {
        return error_response(StatusCode::FORBIDDEN, "bad credentials");
    }
    if headers.get(header::HOST).and_then(|v| v.to_str().ok())
        != Some("ns1.tenant.hcp.example.com")
    {
        return error_response(StatusCode::BAD_REQUEST, "unknown namespace");
    }

    if params.get("type").map(String::as_str) == Some("whole-object") {
        let object = state.objects.lock().unwrap().get(&path).cloned();
        return match object {
            Some(object) => object_response(object, &params, &headers),
            None => error_response(StatusCode::NOT_FOUND, "object not found"),
        };
    }

    let listing = state.listings.lock().unwrap().get(&path).cloned();
    match listing {
        Some(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/xml")
            .body(Body::from(body))
            .unwrap(),
        None => error_response(StatusCode::NOT_FOUND, "directory not found"),
    }
}

fn object_response(
    object: MockObject,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response {
    let metadata_first = headers
        .get("X-HCP-CustomMetadataFirst")
        .and_then(|v| v.to_str().ok())
        == Some("true");
    let annotation = match (params.get("annotation"), &object.annotation) {
        (Some(_), Some(annotation)) if metadata_first => annotation.clone(),
        _ => Vec::new(),
    };

    let size = object
        .size_header
        .clone()
        .unwrap_or_else(|| object.payload.len().to_string());
    let mut body = annotation;
    body.extend_from_slice(&object.payload);

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("X-HCP-Size", size)
        .header(header::LAST_MODIFIED, LAST_MODIFIED)
        .header(header::ETAG, "\"0123abcd\"");
    if let Some(content_type) = &object.content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    if object.chunked {
        let mut body = Bytes::from(body);
        let tail = body.split_off(body.len() / 2);
        let chunks = futures::stream::iter([Ok::<_, std::io::Error>(body), Ok(tail)]);
        return response.body(Body::from_stream(chunks)).unwrap();
    }
    response
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

/// A `directory` listing document with `(urlName, type)` entries.
pub fn listing_xml(path: &str, entries: &[(&str, &str)]) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <directory path=\"{path}\" utf8Path=\"{path}\" parentDir=\"/rest\" \
         dirDeleted=\"false\" showDeleted=\"false\" namespaceName=\"ns1\">\n"
    );
    for (name, kind) in entries {
        let size = if *kind == "object" { " size=\"10\"" } else { "" };
        xml.push_str(&format!(
            "  <entry urlName=\"{name}\" utf8Name=\"{name}\" type=\"{kind}\"{size} \
             hashScheme=\"SHA-256\" hash=\"00FF\" retentionString=\"Deletion Allowed\" \
             hold=\"false\" shred=\"false\" dpl=\"2\" customMetadata=\"false\"/>\n"
        ));
    }
    xml.push_str("</directory>\n");
    xml
}

/// An annotation document naming `file_name`.
pub fn annotation_xml(file_name: &str) -> String {
    format!(
        "<document>\
         <documenttype>MSR</documenttype>\
         <documentfileformat>PDF</documentfileformat>\
         <encryptedaccountnumber>A1B2C3</encryptedaccountnumber>\
         <reportfamily>Statements</reportfamily>\
         <documentlocale>en_US</documentlocale>\
         <reportperiodstartdate>2021-02-01T00:00:00</reportperiodstartdate>\
         <reportperiodenddate>2021-02-28T23:59:59</reportperiodenddate>\
         <reportrundate>2021-03-04T10:11:12</reportrundate>\
         <reporttype>STMT</reporttype>\
         <filecount>1</filecount>\
         <reportfilename>{file_name}</reportfilename>\
         </document>"
    )
}

/// Destination that keeps objects in memory and counts calls.
#[derive(Default)]
pub struct MemoryDestination {
    pub objects: Mutex<HashMap<String, (ObjectDescriptor, Vec<u8>)>>,
    pub exists_calls: AtomicUsize,
    pub put_calls: AtomicUsize,
}

impl MemoryDestination {
    pub fn puts(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn exists_checks(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<(ObjectDescriptor, Vec<u8>)> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn describe(&self) -> String {
        "memory".into()
    }

    async fn exists(&self, key: &str) -> Result<bool, DestinationError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn put(
        &self,
        descriptor: &ObjectDescriptor,
        body: PayloadStream,
    ) -> Result<u64, DestinationError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<Bytes> = body.try_collect().await?;
        let payload = chunks.concat();
        let written = payload.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(descriptor.key.clone(), (descriptor.clone(), payload));
        Ok(written)
    }
}

/// Destination whose first existence check waits until `release` fires.
#[derive(Default)]
pub struct GatedDestination {
    pub inner: MemoryDestination,
    /// Notified when the first existence check starts.
    pub entered: Notify,
    pub release: Notify,
    gated: AtomicBool,
}

#[async_trait]
impl Destination for GatedDestination {
    fn describe(&self) -> String {
        "gated memory".into()
    }

    async fn exists(&self, key: &str) -> Result<bool, DestinationError> {
        if !self.gated.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.exists(key).await
    }

    async fn put(
        &self,
        descriptor: &ObjectDescriptor,
        body: PayloadStream,
    ) -> Result<u64, DestinationError> {
        self.inner.put(descriptor, body).await
    }
}
