//! The transport seam: opaque senders of HTTP requests.
//!
//! The core never talks to a socket itself. It hands a frozen
//! `http::Request<Bytes>` to a [`Transport`] and gets back a future of the
//! raw response plus transfer metrics for progress reporting. Anything that
//! can satisfy that contract plugs in: the default hyper client, any tower
//! `Service` through [`TowerTransport`], or a scripted mock in tests.

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt};
use std::sync::Arc;
use tower::{buffer::Buffer, util::BoxService, BoxError, Layer, Service, ServiceExt};
use tower_http::map_response_body::MapResponseBodyLayer;

#[cfg(feature = "hyper-transport")] mod hyper_transport;
#[cfg(feature = "hyper-transport")]
pub use hyper_transport::HyperTransport;

/// A fully buffered response, before the pipeline sees it.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Byte counts reported by the transport while an exchange is in flight.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferMetrics {
    pub request_bytes_sent: u64,
    pub request_bytes_total: u64,
    pub response_bytes_received: u64,
    /// `None` until the response announces a length.
    pub response_bytes_total: Option<u64>,
}

impl TransferMetrics {
    /// A monotone completion estimate in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        let total = self.request_bytes_total + self.response_bytes_total.unwrap_or(0);
        if total == 0 {
            return 0.0;
        }
        let done = self.request_bytes_sent + self.response_bytes_received;
        (done as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Where transports report transfer progress.
pub type ProgressSink = Arc<dyn Fn(TransferMetrics) + Send + Sync>;

/// An opaque sender of HTTP requests.
///
/// Dropping the returned future aborts the exchange; the core relies on
/// this for cancellation and ignores any response that races it.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: http::Request<Bytes>,
        progress: ProgressSink,
    ) -> BoxFuture<'static, Result<RawResponse, BoxError>>;
}

type BoxedBody = UnsyncBoxBody<Bytes, BoxError>;
type InnerService = BoxService<http::Request<Bytes>, http::Response<BoxedBody>, BoxError>;

/// A [`Transport`] over any tower `Service` stack.
///
/// The service is buffered for cheap cloning and type-erased so callers can
/// assemble whatever middleware they like underneath. This is also the
/// mock-test entry point: a `tower_test::mock::pair` plugs straight in.
#[derive(Clone)]
pub struct TowerTransport {
    inner: Buffer<http::Request<Bytes>, <InnerService as Service<http::Request<Bytes>>>::Future>,
}

impl TowerTransport {
    /// Wrap a tower service. Must be called within a tokio runtime.
    pub fn new<S, B>(service: S) -> Self
    where
        S: Service<http::Request<Bytes>, Response = http::Response<B>> + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let service = MapResponseBodyLayer::new(|b: B| b.map_err(Into::into).boxed_unsync())
            .layer(service)
            .map_err(Into::into);
        TowerTransport {
            inner: Buffer::new(BoxService::new(service), 1024),
        }
    }
}

impl Transport for TowerTransport {
    fn send(
        &self,
        request: http::Request<Bytes>,
        progress: ProgressSink,
    ) -> BoxFuture<'static, Result<RawResponse, BoxError>> {
        let mut svc = self.inner.clone();
        Box::pin(async move {
            let mut metrics = TransferMetrics {
                request_bytes_total: request.body().len() as u64,
                ..TransferMetrics::default()
            };
            progress(metrics);
            let response = svc.ready().await?.call(request).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            metrics.request_bytes_sent = metrics.request_bytes_total;
            metrics.response_bytes_received = body.len() as u64;
            metrics.response_bytes_total = Some(body.len() as u64);
            progress(metrics);
            Ok(RawResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_is_zero_until_totals_are_known() {
        let m = TransferMetrics::default();
        assert_eq!(m.fraction(), 0.0);
    }

    #[test]
    fn fraction_weights_both_directions() {
        let m = TransferMetrics {
            request_bytes_sent: 10,
            request_bytes_total: 10,
            response_bytes_received: 5,
            response_bytes_total: Some(30),
        };
        assert!((m.fraction() - 0.375).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tower_transport_round_trips_a_service() {
        use http_body_util::Full;
        let (mock, mut handle) =
            tower_test::mock::pair::<http::Request<Bytes>, http::Response<Full<Bytes>>>();
        let transport = TowerTransport::new(mock);

        let request = http::Request::builder()
            .uri("https://api.example/hi")
            .body(Bytes::new())
            .unwrap();
        let sent = transport.send(request, Arc::new(|_| {}));

        let serve = async move {
            let (request, send) = handle.next_request().await.expect("request sent");
            assert_eq!(request.uri(), "https://api.example/hi");
            send.send_response(
                http::Response::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::from_static(b"pong")))
                    .unwrap(),
            );
        };
        let (result, ()) = tokio::join!(sent, serve);
        let raw = result.unwrap();
        assert_eq!(raw.status, StatusCode::OK);
        assert_eq!(&raw.body[..], b"pong");
    }
}
