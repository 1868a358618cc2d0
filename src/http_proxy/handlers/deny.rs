//! Rejects every request outright. Grounded on `examples/original_source/
//! pkg/jnproxy/handler/http/deny/deny.go`.

use http::StatusCode;

use crate::error::{Error, Result};
use crate::http_proxy::handler::{Handler, HandlerContext, ProxyRequest, ProxyResponse, ResourceDescriptor};

pub struct Deny;

impl Deny {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Deny {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for Deny {
    fn name(&self) -> &str {
        "Deny"
    }

    fn on_request(&self, req: &ProxyRequest, _ctx: &HandlerContext) -> Result<(Option<ProxyResponse>, bool)> {
        let _ = req;
        Ok((Some(ProxyResponse::forbidden("Forbidden")), false))
    }

    fn on_response(&self, resp: ProxyResponse, req: &ProxyRequest, _ctx: &HandlerContext) -> Result<ProxyResponse> {
        if resp.status != StatusCode::FORBIDDEN {
            return Err(Error::invalid(format!(
                "received response ({}) not forbidden for {}",
                resp.status, req.host
            )));
        }
        Ok(resp)
    }

    fn dependencies(&self) -> Vec<ResourceDescriptor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> ProxyRequest {
        ProxyRequest {
            method: http::Method::GET,
            uri: "/x".parse().unwrap(),
            host: "example.com".to_string(),
            headers: http::HeaderMap::new(),
        }
    }

    #[test]
    fn on_request_short_circuits_with_403() {
        let deny = Deny::new();
        let ctx = HandlerContext { id: 1 };
        let (resp, interested) = deny.on_request(&req(), &ctx).unwrap();
        assert!(!interested);
        assert_eq!(resp.unwrap().status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn on_response_rejects_non_forbidden() {
        let deny = Deny::new();
        let ctx = HandlerContext { id: 1 };
        let ok = ProxyResponse::text(StatusCode::OK, "ok");
        assert!(deny.on_response(ok, &req(), &ctx).is_err());
    }
}
