//! gRPC 服务端观测层
//!
//! 挂在 tonic Server 上的 tower Layer。对每次入站调用：补齐关联 ID、
//! 开启 server span、记录调用数 / 在途数 / 时长指标，按调用结果分级
//! 输出结构化日志，并把 handler panic 恢复为 Internal 状态响应

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderValue, Request, Response};
use metrics::{counter, gauge, histogram};
use tower::{Layer, Service};
use tracing::{debug, error, info, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use argus_core::{
    extract_context, ClientName, RequestId, CLIENT_NAME_HEADER, REQUEST_ID_HEADER,
};

use crate::endpoint::Endpoint;
use crate::{grpc_status, Options};

/// 服务端观测层
///
/// ```ignore
/// Server::builder()
///     .layer(ServerObserveLayer::new(Options::default()))
///     .add_service(svc)
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServerObserveLayer {
    opts: Options,
}

impl ServerObserveLayer {
    pub fn new(opts: Options) -> Self {
        Self { opts }
    }
}

impl<S> Layer<S> for ServerObserveLayer {
    type Service = ServerObserve<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServerObserve {
            inner,
            opts: self.opts.clone(),
        }
    }
}

/// [`ServerObserveLayer`] 产出的服务
#[derive(Debug, Clone)]
pub struct ServerObserve<S> {
    inner: S,
    opts: Options,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ServerObserve<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
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

        // 无法解析的路径与排除的方法直接透传
        let endpoint = match Endpoint::parse(request.uri().path()) {
            Some(e) if !self.opts.is_excluded(&e.method) => e,
            _ => return Box::pin(inner.call(request)),
        };
        let opts = self.opts.clone();

        Box::pin(async move {
            let start = Instant::now();
            let gauge_labels = [
                ("package", endpoint.package.clone()),
                ("service", endpoint.service.clone()),
                ("method", endpoint.method.clone()),
            ];
            gauge!("incoming_grpc_requests_active", &gauge_labels).increment(1.0);

            // 确保调用带有关联 ID
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

            let client_name = request
                .headers()
                .get(CLIENT_NAME_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(ClientName::new);

            let parent_cx = extract_context(request.headers());
            let span = info_span!(
                "grpc_server_request",
                otel.kind = "server",
                rpc.package = %endpoint.package,
                rpc.service = %endpoint.service,
                rpc.method = %endpoint.method,
                request_id = %request_id,
                client_name = tracing::field::Empty,
                rpc.grpc.status_code = tracing::field::Empty,
                otel.status_code = tracing::field::Empty,
            );
            span.set_parent(parent_cx);
            if let Some(name) = &client_name {
                span.record("client_name", name.as_str());
            }

            request.extensions_mut().insert(request_id.clone());
            if let Some(name) = client_name.clone() {
                request.extensions_mut().insert(name);
            }

            // panic 恢复为 Internal 状态，进程不退出
            let outcome = AssertUnwindSafe(inner.call(request).instrument(span.clone()))
                .catch_unwind()
                .await;
            let mut result = match outcome {
                Ok(result) => result,
                Err(payload) => {
                    error!(
                        panic = %panic_message(&payload),
                        endpoint = %endpoint,
                        "Panic occurred in grpc handler"
                    );
                    counter!("grpc_handler_panics_total").increment(1);
                    Ok(internal_error_response())
                }
            };

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
            counter!("incoming_grpc_requests_total", &labels).increment(1);
            histogram!("incoming_grpc_requests_duration_ms", &labels).record(duration_ms);
            gauge!("incoming_grpc_requests_active", &gauge_labels).decrement(1.0);

            span.record("rpc.grpc.status_code", i64::from(status_code));
            if !success {
                span.record("otel.status_code", "ERROR");
            }

            // 把调用元数据回传给调用方
            if let Ok(response) = result.as_mut() {
                if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                    response.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                if let Some(name) = &client_name {
                    if let Ok(value) = HeaderValue::from_str(name.as_str()) {
                        response.headers_mut().insert(CLIENT_NAME_HEADER, value);
                    }
                }
            }

            let code = tonic::Code::from_i32(status_code);
            if success {
                if opts.log_at_debug {
                    debug!(
                        endpoint = %endpoint,
                        code = ?code,
                        duration_ms,
                        request_id = %request_id,
                        "Request handled"
                    );
                } else {
                    info!(
                        endpoint = %endpoint,
                        code = ?code,
                        duration_ms,
                        request_id = %request_id,
                        "Request handled"
                    );
                }
            } else {
                error!(
                    endpoint = %endpoint,
                    code = ?code,
                    duration_ms,
                    request_id = %request_id,
                    "Request handled"
                );
            }

            result
        })
    }
}

/// trailers-only 的 Internal 错误响应
fn internal_error_response<B: Default>() -> Response<B> {
    let mut response = Response::new(B::default());
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/grpc"));
    response
        .headers_mut()
        .insert("grpc-status", HeaderValue::from_static("13"));
    response
        .headers_mut()
        .insert("grpc-message", HeaderValue::from_static("internal error"));
    response
}

fn panic_message(payload: &Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::{service_fn, ServiceExt};

    fn ok_handler(
        _request: Request<()>,
    ) -> futures::future::Ready<Result<Response<()>, Infallible>> {
        futures::future::ready(Ok(Response::new(())))
    }

    fn grpc_request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_generates_request_id() {
        let svc = ServerObserveLayer::new(Options::default()).layer(service_fn(ok_handler));

        let response = svc
            .oneshot(grpc_request("/itemPB.ItemManager/GetItem"))
            .await
            .unwrap();

        let id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .expect("response should carry a request id");
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_preserves_existing_request_id() {
        let svc = ServerObserveLayer::new(Options::default()).layer(service_fn(
            |request: Request<()>| async move {
                // handler 通过扩展拿到同一个 ID
                let id = request.extensions().get::<RequestId>().cloned();
                assert_eq!(id.as_ref().map(|i| i.as_str()), Some("abc-123"));
                Ok::<_, Infallible>(Response::new(()))
            },
        ));

        let mut request = grpc_request("/itemPB.ItemManager/GetItem");
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));

        let response = svc.oneshot(request).await.unwrap();

        assert_eq!(
            response
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("abc-123")
        );
    }

    #[tokio::test]
    async fn test_echoes_client_name() {
        let svc = ServerObserveLayer::new(Options::default()).layer(service_fn(ok_handler));

        let mut request = grpc_request("/itemPB.ItemManager/GetItem");
        request
            .headers_mut()
            .insert(CLIENT_NAME_HEADER, HeaderValue::from_static("gateway"));

        let response = svc.oneshot(request).await.unwrap();

        assert_eq!(
            response
                .headers()
                .get(CLIENT_NAME_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("gateway")
        );
    }

    #[tokio::test]
    async fn test_excluded_method_bypassed() {
        let opts = Options {
            excluded_methods: vec!["Check".to_string()],
            ..Options::default()
        };
        let svc = ServerObserveLayer::new(opts).layer(service_fn(ok_handler));

        let response = svc
            .oneshot(grpc_request("/grpc.health.v1.Health/Check"))
            .await
            .unwrap();

        // 透传路径不补齐关联 ID
        assert!(!response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_unparseable_path_bypassed() {
        let svc = ServerObserveLayer::new(Options::default()).layer(service_fn(ok_handler));

        let response = svc.oneshot(grpc_request("/metrics")).await.unwrap();

        assert!(!response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_panic_becomes_internal() {
        let svc = ServerObserveLayer::new(Options::default()).layer(service_fn(
            |_request: Request<()>| async move {
                panic!("boom");
                #[allow(unreachable_code)]
                Ok::<_, Infallible>(Response::new(()))
            },
        ));

        let response = svc
            .oneshot(grpc_request("/itemPB.ItemManager/GetItem"))
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get("grpc-status")
                .and_then(|v| v.to_str().ok()),
            Some("13")
        );
        // panic 恢复后仍然回传关联 ID
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[test]
    fn test_gauge_returns_to_zero_and_outcomes_counted() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let ok_svc =
                    ServerObserveLayer::new(Options::default()).layer(service_fn(ok_handler));
                let _ = ok_svc
                    .oneshot(grpc_request("/itemPB.ItemManager/GetItem"))
                    .await
                    .unwrap();

                // trailers-only 错误响应计为失败
                let failing_svc = ServerObserveLayer::new(Options::default()).layer(service_fn(
                    |_request: Request<()>| async move {
                        let mut response = Response::new(());
                        response
                            .headers_mut()
                            .insert("grpc-status", HeaderValue::from_static("5"));
                        Ok::<_, Infallible>(response)
                    },
                ));
                let _ = failing_svc
                    .oneshot(grpc_request("/itemPB.ItemManager/GetItem"))
                    .await
                    .unwrap();

                let panicking_svc = ServerObserveLayer::new(Options::default()).layer(service_fn(
                    |_request: Request<()>| async move {
                        panic!("boom");
                        #[allow(unreachable_code)]
                        Ok::<_, Infallible>(Response::new(()))
                    },
                ));
                let _ = panicking_svc
                    .oneshot(grpc_request("/itemPB.ItemManager/GetItem"))
                    .await
                    .unwrap();
            });
        });

        let rendered = handle.render();

        let mut saw_gauge = false;
        for line in rendered.lines() {
            if line.starts_with("incoming_grpc_requests_active") {
                saw_gauge = true;
                assert!(line.trim_end().ends_with(" 0"), "gauge not restored: {line}");
            }
        }
        assert!(saw_gauge);
        assert!(rendered.contains("success=\"true\""));
        assert!(rendered.contains("success=\"false\""));

        // panic 恰好使计数器加一
        assert!(
            rendered
                .lines()
                .any(|line| line.trim_end() == "grpc_handler_panics_total 1"),
            "panic counter missing or wrong: {rendered}"
        );
    }
}
