//! gRPC 客户端观测层
//!
//! 包装 tonic Channel 的 tower Layer。对每次出站调用：补齐关联 ID、
//! 附带调用方名称、注入 trace context、开启 client span，并记录
//! 调用数 / 时长指标与一条结构化日志

use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use http::{HeaderValue, Request, Response};
use metrics::{counter, histogram};
use tower::{Layer, Service};
use tracing::{debug, error, info, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use argus_core::{
    inject_context, Observer, RequestId, CLIENT_NAME_HEADER, REQUEST_ID_HEADER,
};

use crate::endpoint::Endpoint;
use crate::{grpc_status, Options};

/// 客户端观测层
///
/// ```ignore
/// let channel = Channel::from_static("http://localhost:9000").connect().await?;
/// let channel = ServiceBuilder::new()
///     .layer(ClientObserveLayer::new(&observer, Options::default()))
///     .service(channel);
/// let client = ItemManagerClient::new(channel);
/// ```
#[derive(Debug, Clone)]
pub struct ClientObserveLayer {
    name: String,
    opts: Options,
}

impl ClientObserveLayer {
    /// 以 Observer 的服务名作为 client-name 发送给对端
    pub fn new(observer: &Observer, opts: Options) -> Self {
        Self::with_name(observer.name(), opts)
    }

    pub fn with_name(name: impl Into<String>, opts: Options) -> Self {
        Self {
            name: name.into(),
            opts,
        }
    }
}

impl<S> Layer<S> for ClientObserveLayer {
    type Service = ClientObserve<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClientObserve {
            inner,
            name: self.name.clone(),
            opts: self.opts.clone(),
        }
    }
}

/// [`ClientObserveLayer`] 产出的服务
#[derive(Debug, Clone)]
pub struct ClientObserve<S> {
    inner: S,
    name: String,
    opts: Options,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ClientObserve<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let endpoint = match Endpoint::parse(request.uri().path()) {
            Some(e) if !self.opts.is_excluded(&e.method) => e,
            _ => return Box::pin(inner.call(request)),
        };
        let name = self.name.clone();
        let opts = self.opts.clone();

        Box::pin(async move {
            let start = Instant::now();

            // 确保调用带有关联 ID，并亮明调用方身份
            let request_id = match request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
            {
                Some(value) => RequestId::from_string(value),
                None => RequestId::new(),
            };
            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                request.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            if let Ok(value) = HeaderValue::from_str(&name) {
                request.headers_mut().insert(CLIENT_NAME_HEADER, value);
            }

            let span = info_span!(
                "grpc_client_request",
                otel.kind = "client",
                rpc.package = %endpoint.package,
                rpc.service = %endpoint.service,
                rpc.method = %endpoint.method,
                request_id = %request_id,
                rpc.grpc.status_code = tracing::field::Empty,
                otel.status_code = tracing::field::Empty,
            );
            {
                let _enter = span.enter();
                let cx = tracing::Span::current().context();
                inject_context(&cx, request.headers_mut());
            }

            let result = inner.call(request).instrument(span.clone()).await;

            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
            let status_code = match &result {
                Ok(response) => grpc_status(response.headers()),
                Err(_) => tonic::Code::Unknown as i32,
            };
            let success = result.is_ok() && status_code == 0;

            let labels = [
                ("package", endpoint.package.clone()),
                ("service", endpoint.service.clone()),
                ("method", endpoint.method.clone()),
                ("success", success.to_string()),
            ];
            counter!("outgoing_grpc_requests_total", &labels).increment(1);
            histogram!("outgoing_grpc_requests_duration_ms", &labels).record(duration_ms);

            span.record("rpc.grpc.status_code", i64::from(status_code));
            if !success {
                span.record("otel.status_code", "ERROR");
            }

            let code = tonic::Code::from_i32(status_code);
            if success {
                if opts.log_at_debug {
                    debug!(
                        endpoint = %endpoint,
                        code = ?code,
                        duration_ms,
                        request_id = %request_id,
                        "Request sent"
                    );
                } else {
                    info!(
                        endpoint = %endpoint,
                        code = ?code,
                        duration_ms,
                        request_id = %request_id,
                        "Request sent"
                    );
                }
            } else {
                error!(
                    endpoint = %endpoint,
                    code = ?code,
                    duration_ms,
                    request_id = %request_id,
                    "Request sent"
                );
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use tower::{service_fn, ServiceExt};

    fn grpc_request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    fn observed_echo() -> impl tower::Service<
        Request<()>,
        Response = Response<Option<String>>,
        Error = Infallible,
    > {
        // 把收到的 client-name 回显到响应体，便于断言
        ClientObserveLayer::with_name("gateway", Options::default()).layer(service_fn(
            |request: Request<()>| async move {
                let name = request
                    .headers()
                    .get(CLIENT_NAME_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok::<_, Infallible>(Response::new(name))
            },
        ))
    }

    #[tokio::test]
    async fn test_sets_client_name() {
        let response = observed_echo()
            .oneshot(grpc_request("/itemPB.ItemManager/GetItem"))
            .await
            .unwrap();

        assert_eq!(response.into_body().as_deref(), Some("gateway"));
    }

    #[tokio::test]
    async fn test_generates_request_id() {
        let svc = ClientObserveLayer::with_name("gateway", Options::default()).layer(service_fn(
            |request: Request<()>| async move {
                let id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok::<_, Infallible>(Response::new(id))
            },
        ));

        let response = svc
            .oneshot(grpc_request("/itemPB.ItemManager/GetItem"))
            .await
            .unwrap();

        let id = response.into_body().expect("request id should be set");
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_preserves_existing_request_id() {
        let svc = ClientObserveLayer::with_name("gateway", Options::default()).layer(service_fn(
            |request: Request<()>| async move {
                let id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok::<_, Infallible>(Response::new(id))
            },
        ));

        let mut request = grpc_request("/itemPB.ItemManager/GetItem");
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));

        let response = svc.oneshot(request).await.unwrap();

        assert_eq!(response.into_body().as_deref(), Some("abc-123"));
    }

    #[tokio::test]
    async fn test_excluded_method_bypassed() {
        let opts = Options {
            excluded_methods: vec!["Check".to_string()],
            ..Options::default()
        };
        let svc = ClientObserveLayer::with_name("gateway", opts).layer(service_fn(
            |request: Request<()>| async move {
                let name = request
                    .headers()
                    .get(CLIENT_NAME_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok::<_, Infallible>(Response::new(name))
            },
        ));

        let response = svc
            .oneshot(grpc_request("/grpc.health.v1.Health/Check"))
            .await
            .unwrap();

        // 透传路径不附加任何请求头
        assert_eq!(response.into_body(), None);
    }
}
