//! The default transport, on hyper-util's legacy client.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use http::header;
use http_body_util::{BodyExt, Full};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tower::BoxError;

use super::{ProgressSink, RawResponse, TransferMetrics, Transport};

/// Plain-HTTP transport for production use.
///
/// TLS, proxying and connection tuning are deliberately left to callers
/// who assemble their own stack and wrap it in
/// [`TowerTransport`](super::TowerTransport).
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        HyperTransport {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        HyperTransport::new()
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        request: http::Request<Bytes>,
        progress: ProgressSink,
    ) -> BoxFuture<'static, Result<RawResponse, BoxError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut metrics = TransferMetrics {
                request_bytes_total: request.body().len() as u64,
                ..TransferMetrics::default()
            };
            progress(metrics);

            let (parts, body) = request.into_parts();
            let request = http::Request::from_parts(parts, Full::new(body));
            let response = client.request(request).await?;
            metrics.request_bytes_sent = metrics.request_bytes_total;
            metrics.response_bytes_total = response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            progress(metrics);

            let (parts, mut body) = response.into_parts();
            let mut collected = BytesMut::new();
            while let Some(frame) = body.frame().await {
                if let Ok(data) = frame?.into_data() {
                    collected.extend_from_slice(&data);
                    metrics.response_bytes_received = collected.len() as u64;
                    progress(metrics);
                }
            }
            Ok(RawResponse {
                status: parts.status,
                headers: parts.headers,
                body: collected.freeze(),
            })
        })
    }
}
