//! Records dataset downloads from the Huggingface hub and the CDN buckets
//! it redirects to. Grounded on `examples/original_source/pkg/jnproxy/
//! handler/http/huggingface/dataset/hf.go`.

use std::io::Read;

use http::StatusCode;
use serde_json::json;
use sha2::{Digest as _, Sha256};

use crate::error::Result;
use crate::http_proxy::handler::{
    DescriptorSink, Handler, HandlerContext, ProxyRequest, ProxyResponse, ResourceDescriptor,
};
use crate::http_proxy::handlers::abs_url_path;
use crate::repository::DigestSet;

pub struct HuggingfaceDataset {
    sink: DescriptorSink,
}

impl HuggingfaceDataset {
    pub fn new() -> Self {
        Self {
            sink: DescriptorSink::new(),
        }
    }
}

impl Default for HuggingfaceDataset {
    fn default() -> Self {
        Self::new()
    }
}

fn is_interested(host: &str, abs_path: &str) -> bool {
    (host == "huggingface.co" && abs_path.contains("/datasets/"))
        || (host == "cdn-lfs.huggingface.co" && abs_path.contains("/datasets/"))
        || host == "datasets-server.huggingface.co"
        || (host == "s3.amazonaws.com" && abs_path.starts_with("/datasets.huggingface.co/"))
        || (host == "storage.googleapis.com"
            && (abs_path.starts_with("/huggingface-nlp/") || abs_path.starts_with("/cvdf-datasets/")))
}

/// Best-effort gzip inflation used only to validate the payload is
/// well-formed before it is hashed and recorded; the recorded digest is
/// still taken over the compressed bytes exactly as received.
fn validate_gzip(body: &[u8]) -> std::io::Result<()> {
    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut sink = Vec::new();
    decoder.read_to_end(&mut sink)?;
    Ok(())
}

impl Handler for HuggingfaceDataset {
    fn name(&self) -> &str {
        "HuggingfaceDataset/v0.1"
    }

    fn on_request(&self, req: &ProxyRequest, _ctx: &HandlerContext) -> Result<(Option<ProxyResponse>, bool)> {
        let abs_path = abs_url_path(req.uri.path());
        Ok((None, is_interested(&req.host, &abs_path)))
    }

    fn on_response(&self, resp: ProxyResponse, req: &ProxyRequest, ctx: &HandlerContext) -> Result<ProxyResponse> {
        if req.method == http::Method::HEAD {
            return Ok(resp);
        }

        let actual_len = resp.body.len();
        let header_len: usize = match resp.headers.get(http::header::CONTENT_LENGTH) {
            Some(v) => v
                .to_str()
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| crate::error::Error::invalid("Content-Length header is not a valid integer"))?,
            None => return Ok(ProxyResponse::internal_error("Content-Length header is not a valid integer")),
        };
        if header_len != actual_len {
            let msg = format!("length mismatch. Header ({header_len}) != actual ({actual_len})");
            return Ok(ProxyResponse::internal_error(msg));
        }
        let content_type = match resp.headers.get(http::header::CONTENT_TYPE) {
            Some(v) => v.to_str().unwrap_or_default().to_string(),
            None => return Ok(ProxyResponse::internal_error("Content-Type is empty")),
        };

        match content_type.as_str() {
            // TODO: list and descend into the archive's member files instead
            // of hashing the archive as one opaque blob.
            "application/zip" => {}
            "binary/octet-stream" => {
                // https://huggingface.co/docs/datasets-server/en/parquet
            }
            "application/x-gzip" => {
                if let Err(e) = validate_gzip(&resp.body) {
                    let msg = format!("gzip read: {e}");
                    return Ok(ProxyResponse::internal_error(msg));
                }
            }
            _ => {}
        }

        let x_repo_commit = resp
            .headers
            .get("X-Repo-Commit")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut hasher = Sha256::new();
        hasher.update(&resp.body);
        let digest_hex = hex::encode(hasher.finalize());

        // WARNING: query parameters are not recorded.
        let url = format!("{}{}", req.host, req.uri.path());

        let mut digest = DigestSet::new();
        digest.insert("sha256".to_string(), digest_hex);
        if !x_repo_commit.is_empty() {
            digest.insert("hint:gitCommit".to_string(), x_repo_commit);
        }

        let descriptor = ResourceDescriptor {
            uri: Some(url.clone()),
            digest,
            name: None,
            download_location: Some(url),
            media_type: None,
            content_length: Some(actual_len as u64),
            annotations: Some(json!({
                "Handler": self.name(),
                "HTTP": {
                    "Method": req.method.as_str(),
                    "Header": {
                        "Content-Length": header_len,
                        "Content-Type": content_type,
                    },
                },
            })),
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
    use http::HeaderMap;

    fn req(host: &str, path: &str) -> ProxyRequest {
        ProxyRequest {
            method: http::Method::GET,
            uri: path.parse().unwrap(),
            host: host.to_string(),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn interested_in_dataset_paths() {
        let h = HuggingfaceDataset::new();
        let ctx = HandlerContext { id: 1 };
        let (_, interested) = h.on_request(&req("huggingface.co", "/datasets/squad/resolve/main/data.json"), &ctx).unwrap();
        assert!(interested);
    }

    #[test]
    fn interested_in_gcs_bucket_prefix() {
        let h = HuggingfaceDataset::new();
        let ctx = HandlerContext { id: 1 };
        let (_, interested) = h.on_request(&req("storage.googleapis.com", "/cvdf-datasets/mnist/train.gz"), &ctx).unwrap();
        assert!(interested);
    }

    #[test]
    fn not_interested_in_unrelated_bucket_path() {
        let h = HuggingfaceDataset::new();
        let ctx = HandlerContext { id: 1 };
        let (_, interested) = h.on_request(&req("storage.googleapis.com", "/other-bucket/file"), &ctx).unwrap();
        assert!(!interested);
    }

    #[test]
    fn rejects_malformed_gzip_body() {
        let h = HuggingfaceDataset::new();
        let ctx = HandlerContext { id: 2 };
        let r = req("huggingface.co", "/datasets/squad/resolve/main/data.gz");
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, "3".parse().unwrap());
        headers.insert(http::header::CONTENT_TYPE, "application/x-gzip".parse().unwrap());
        let resp = ProxyResponse {
            status: StatusCode::OK,
            headers,
            body: bytes::Bytes::from_static(b"bad"),
        };
        let out = h.on_response(resp, &r, &ctx).unwrap();
        assert_eq!(out.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
