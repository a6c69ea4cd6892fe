use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::*;

use crate::metric::Metrics;
use crate::middleware::{Pipeline, RequestHeaders};

/// Header view over a pingora request.
struct PingoraHeaders<'a>(&'a RequestHeader);

impl RequestHeaders for PingoraHeaders<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.0.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Per-request state carried from `request_filter` to `response_filter`.
#[derive(Default)]
pub struct RequestCtx {
    project_id: Option<u64>,
    headers: Vec<(&'static str, String)>,
}

/// Quota-enforcing reverse proxy in front of a single upstream.
pub struct QuotaProxy {
    pipeline: Arc<Pipeline>,
    upstream: String,
    metrics: Arc<Metrics>,
}

impl QuotaProxy {
    pub fn new(pipeline: Arc<Pipeline>, upstream: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            pipeline,
            upstream: upstream.into(),
            metrics,
        }
    }
}

#[async_trait]
impl ProxyHttp for QuotaProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let client_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip().to_string());

        let outcome = {
            let headers = PingoraHeaders(session.req_header());
            self.pipeline
                .handle(&headers, client_ip.as_deref(), Utc::now())
                .await
        };
        ctx.project_id = outcome.project_id();
        self.metrics
            .observe(self.pipeline.client().service(), &outcome);

        if let Some(body) = outcome.error_response() {
            let status = outcome.status();
            if let Some(project_id) = ctx.project_id {
                self.metrics.record_status(project_id, status);
            }

            let body = serde_json::to_vec(&body).map_err(|e| {
                Error::explain(
                    ErrorType::InternalError,
                    format!("failed to encode error response: {e}"),
                )
            })?;
            let mut header = ResponseHeader::build(status, None)?;
            for (name, value) in &outcome.headers {
                header.insert_header(*name, value.clone())?;
            }
            header.insert_header("Content-Type", "application/json")?;
            header.insert_header("Content-Length", body.len().to_string())?;
            session.set_keepalive(None);
            session
                .write_response_header(Box::new(header), false)
                .await?;
            session
                .write_response_body(Some(Bytes::from(body)), true)
                .await?;
            return Ok(true);
        }

        ctx.headers = outcome.headers;
        Ok(false)
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        for (name, value) in &ctx.headers {
            upstream_response.insert_header(*name, value.clone())?;
        }
        if let Some(project_id) = ctx.project_id {
            self.metrics
                .record_status(project_id, upstream_response.status.as_u16());
        }
        Ok(())
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Ok(Box::new(HttpPeer::new(
            self.upstream.clone(),
            false, // plain HTTP to the upstream
            String::new(),
        )))
    }
}
