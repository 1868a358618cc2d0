//! Records every response that passes through it, unconditionally
//! interested in every request. Grounded on `examples/original_source/pkg/
//! jnproxy/handler/http/allow/allow.go`.
//!
//! The Go `AllowCb.WantRecord` callback (let the embedder skip recording,
//! e.g. zero-length bodies, and optionally copy named response headers into
//! the descriptor) becomes a small trait object set at construction time,
//! since Rust handlers are plain values rather than structs embedders
//! further embed.

use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use serde_json::json;
use sha2::{Digest as _, Sha256};

use crate::http_proxy::handler::{
    DescriptorSink, Handler, HandlerContext, ProxyRequest, ProxyResponse, ResourceDescriptor,
};

/// Decides whether a given response should be recorded, and which response
/// headers (if any) to copy into the descriptor's annotations.
pub trait RecordPolicy: Send + Sync {
    fn want_record(&self, resp: &ProxyResponse, ctx: &HandlerContext) -> (bool, Option<HeaderMap>);
}

struct RecordAlways;

impl RecordPolicy for RecordAlways {
    fn want_record(&self, _resp: &ProxyResponse, _ctx: &HandlerContext) -> (bool, Option<HeaderMap>) {
        (true, None)
    }
}

pub struct Allow {
    policy: Arc<dyn RecordPolicy>,
    sink: DescriptorSink,
}

impl Allow {
    pub fn new() -> Self {
        Self {
            policy: Arc::new(RecordAlways),
            sink: DescriptorSink::new(),
        }
    }

    pub fn with_policy(policy: Arc<dyn RecordPolicy>) -> Self {
        Self {
            policy,
            sink: DescriptorSink::new(),
        }
    }
}

impl Default for Allow {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for Allow {
    fn name(&self) -> &str {
        "Allow/v0.1"
    }

    fn on_request(&self, _req: &ProxyRequest, _ctx: &HandlerContext) -> crate::error::Result<(Option<ProxyResponse>, bool)> {
        Ok((None, true))
    }

    fn on_response(&self, resp: ProxyResponse, req: &ProxyRequest, ctx: &HandlerContext) -> crate::error::Result<ProxyResponse> {
        let (record, header_record) = self.policy.want_record(&resp, ctx);
        if !record {
            return Ok(resp);
        }

        let actual_len = resp.body.len();
        let header_len = match resp.headers.get(http::header::CONTENT_LENGTH) {
            Some(v) => Some(
                v.to_str()
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| crate::error::Error::invalid("Content-Length header is not a valid integer"))?,
            ),
            None => None,
        };
        // RFC 9110 §8.6: a HEAD response may carry a non-zero Content-Length
        // with an empty body.
        if req.method != http::Method::HEAD {
            if let Some(header_len) = header_len {
                if header_len != actual_len {
                    let msg = format!("length mismatch. Header ({header_len}) != actual ({actual_len})");
                    return Ok(ProxyResponse::internal_error(msg));
                }
            }
        }

        let content_type = match resp.headers.get(http::header::CONTENT_TYPE) {
            Some(v) => v.to_str().unwrap_or_default().to_string(),
            None => return Ok(ProxyResponse::internal_error("Content-Type is empty")),
        };

        let mut hasher = Sha256::new();
        hasher.update(&resp.body);
        let digest_hex = hex::encode(hasher.finalize());

        // WARNING: query parameters are not recorded.
        let url = format!("{}{}", req.host, req.uri.path());

        let mut annotations = json!({
            "Handler": self.name(),
            "HTTP": {
                "Method": req.method.as_str(),
                "Header": {
                    "Content-Length": header_len,
                    "Content-Type": content_type,
                },
            },
        });
        if let Some(headers) = header_record {
            let recorded: serde_json::Map<String, serde_json::Value> = headers
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or_default())))
                .collect();
            annotations["HTTPHeader"] = serde_json::Value::Object(recorded);
        }

        let mut digest = crate::repository::DigestSet::new();
        digest.insert("sha256".to_string(), digest_hex);

        let descriptor = ResourceDescriptor {
            uri: Some(url.clone()),
            digest,
            name: None,
            download_location: Some(url),
            media_type: None,
            content_length: Some(actual_len as u64),
            annotations: Some(annotations),
        };
        self.sink.store(ctx.id, descriptor);

        Ok(resp)
    }

    fn dependencies(&self) -> Vec<ResourceDescriptor> {
        self.sink.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> ProxyRequest {
        ProxyRequest {
            method: http::Method::GET,
            uri: "/a/b?x=1".parse().unwrap(),
            host: "example.com".to_string(),
            headers: HeaderMap::new(),
        }
    }

    fn resp_with(body: &str, content_type: &str) -> ProxyResponse {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, body.len().to_string().parse().unwrap());
        headers.insert(http::header::CONTENT_TYPE, content_type.parse().unwrap());
        ProxyResponse {
            status: StatusCode::OK,
            headers,
            body: bytes::Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn records_descriptor_for_valid_response() {
        let allow = Allow::new();
        let ctx = HandlerContext { id: 7 };
        let out = allow.on_response(resp_with("hello", "text/plain"), &req(), &ctx).unwrap();
        assert_eq!(out.status, StatusCode::OK);
        let deps = allow.dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].uri.as_deref(), Some("example.com/a/b"));
        assert!(deps[0].digest.contains_key("sha256"));
    }

    #[test]
    fn dependencies_drains_state() {
        let allow = Allow::new();
        let ctx = HandlerContext { id: 1 };
        allow.on_response(resp_with("x", "text/plain"), &req(), &ctx).unwrap();
        assert_eq!(allow.dependencies().len(), 1);
        assert_eq!(allow.dependencies().len(), 0);
    }

    #[test]
    fn content_length_mismatch_yields_500_and_no_descriptor() {
        let allow = Allow::new();
        let ctx = HandlerContext { id: 5 };
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, "7".parse().unwrap());
        headers.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let resp = ProxyResponse {
            status: StatusCode::OK,
            headers,
            body: bytes::Bytes::from_static(b"hello"),
        };
        let out = allow.on_response(resp, &req(), &ctx).unwrap();
        assert_eq!(out.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(allow.dependencies().is_empty());
    }

    #[test]
    fn missing_content_type_yields_500() {
        let allow = Allow::new();
        let ctx = HandlerContext { id: 1 };
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, "1".parse().unwrap());
        let resp = ProxyResponse {
            status: StatusCode::OK,
            headers,
            body: bytes::Bytes::from_static(b"x"),
        };
        let out = allow.on_response(resp, &req(), &ctx).unwrap();
        assert_eq!(out.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
