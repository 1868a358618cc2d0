//! The pluggable handler contract. See `spec.md` §4.5 and `examples/
//! original_source/pkg/jnproxy/handler/http/handler.go` for the interface
//! this is grounded on.
//!
//! Unlike the Go interface (which streams `*http.Request`/`*http.Response`
//! and lets each handler read the body itself), requests and responses here
//! are fully buffered into [`ProxyRequest`]/[`ProxyResponse`] before
//! dispatch — the proxy core does the one `hyper` body read, and every
//! handler operates on plain bytes. This mirrors what each Go handler did
//! anyway (`ioutil.ReadAll(resp.Body)` as the first line of every
//! `OnResponse`), just hoisted to the caller.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::repository::DigestSet;

/// A fully buffered request as seen by the handler chain.
#[derive(Clone, Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub host: String,
    pub headers: HeaderMap,
}

/// A fully buffered response as seen by the handler chain.
#[derive(Clone, Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let body = body.into();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());
        Self {
            status,
            headers,
            body: Bytes::from(body),
        }
    }

    pub fn forbidden(body: impl Into<String>) -> Self {
        Self::text(StatusCode::FORBIDDEN, body)
    }

    pub fn internal_error(body: impl Into<String>) -> Self {
        Self::text(StatusCode::INTERNAL_SERVER_ERROR, body)
    }
}

/// Per-request metadata handed to a handler alongside the request/response.
/// `id` is unique and stable across the `on_request`/`on_response` pair for
/// one request, matching the Go `Context.ID`.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub id: u64,
}

/// One resolved dependency, matching `slsa.ResourceDescriptor`. Serializes
/// with the same field names so a `provenance.json` produced here is
/// shaped like the one the original library would have produced.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "DigestSet::is_empty", default)]
    pub digest: DigestSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "downloadLocation", skip_serializing_if = "Option::is_none")]
    pub download_location: Option<String>,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(rename = "contentLength", skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

/// Ordered chain member. `on_request` returns `(short_circuit_response,
/// interested)`: a `Some` response ends the request immediately (the deny
/// handler's 403); `interested` controls whether `on_response` is called
/// once the origin replies, mirroring the Go `bool` return.
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    fn on_request(&self, req: &ProxyRequest, ctx: &HandlerContext) -> Result<(Option<ProxyResponse>, bool)>;

    fn on_response(&self, resp: ProxyResponse, req: &ProxyRequest, ctx: &HandlerContext) -> Result<ProxyResponse>;

    /// Drains and returns every descriptor this handler has accumulated
    /// since the last call. Called once per provenance build.
    fn dependencies(&self) -> Vec<ResourceDescriptor>;
}

/// Shared id-keyed descriptor accumulator used by every built-in handler, in
/// place of the Go `HandlerImpl` embedded struct (`Store`/`Dependencies`)
/// that Rust's trait model has no equivalent embedding for.
#[derive(Default)]
pub struct DescriptorSink {
    pending: Mutex<BTreeMap<u64, ResourceDescriptor>>,
}

impl DescriptorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, id: u64, descriptor: ResourceDescriptor) {
        self.pending
            .lock()
            .expect("descriptor sink poisoned")
            .insert(id, descriptor);
    }

    pub fn drain(&self) -> Vec<ResourceDescriptor> {
        let mut pending = self.pending.lock().expect("descriptor sink poisoned");
        std::mem::take(&mut *pending).into_values().collect()
    }
}
