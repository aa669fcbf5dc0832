//! HTTP 服务端观测中间件
//!
//! 对每个入站请求：补齐关联 ID、开启 server span、记录请求数 /
//! 在途数 / 时长指标，并按响应状态码分级输出一条结构化日志。
//! panic 恢复层单独提供，叠放在本中间件内侧

use std::any::Any;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use metrics::{counter, gauge, histogram};
use tower_http::catch_panic::{CatchPanicLayer, ResponseForPanic};
use tracing::{debug, error, info, info_span, warn, Instrument, Level};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use argus_core::{
    extract_context, ClientName, RequestId, CLIENT_NAME_HEADER, REQUEST_ID_HEADER,
};

use crate::level_for_status;
use crate::route::normalize_route_with;

/// 中间件可选配置
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// 成功请求记录在 debug 级别（默认 info）
    pub log_at_debug: bool,
    /// 自定义 id 段模式，替代默认的 uuid / 数字判定
    pub id_pattern: Option<regex::Regex>,
}

/// Axum 观测中间件
///
/// 通过 `middleware::from_fn_with_state(options, observe)` 挂载。
/// panic 恢复需要另外叠加 [`recovery_layer`]，且必须在本中间件内侧，
/// 这样 panic 转换出的 500 响应仍会计入时长指标并恢复 in-flight gauge
pub async fn observe(State(opts): State<Options>, mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let route = normalize_route_with(&path, opts.id_pattern.as_ref());

    let gauge_labels = [("method", method.clone()), ("route", route.clone())];
    gauge!("incoming_http_requests_active", &gauge_labels).increment(1.0);

    // 确保请求带有关联 ID
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

    // 远端 trace context 作为本地 server span 的父节点
    let parent_cx = extract_context(request.headers());
    let span = info_span!(
        "http_server_request",
        otel.kind = "server",
        http.method = %method,
        http.route = %route,
        request_id = %request_id,
        client_name = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        otel.status_code = tracing::field::Empty,
    );
    span.set_parent(parent_cx);
    if let Some(name) = &client_name {
        span.record("client_name", name.as_str());
    }

    // 下游 handler 通过请求扩展读取关联 ID 与调用方名称
    request.extensions_mut().insert(request_id.clone());
    if let Some(name) = client_name.clone() {
        request.extensions_mut().insert(name);
    }

    let mut response = next.run(request).instrument(span.clone()).await;

    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    let status = response.status().as_u16();
    let status_class = format!("{}xx", status / 100);

    let labels = [
        ("method", method.clone()),
        ("route", route.clone()),
        ("status_code", status.to_string()),
        ("status_class", status_class.clone()),
    ];
    counter!("incoming_http_requests_total", &labels).increment(1);
    histogram!("incoming_http_requests_duration_ms", &labels).record(duration_ms);
    gauge!("incoming_http_requests_active", &gauge_labels).decrement(1.0);

    span.record("http.status_code", status);
    if status >= 500 {
        span.record("otel.status_code", "ERROR");
    }

    // 把请求元数据回传给调用方
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    if let Some(name) = &client_name {
        if let Ok(value) = HeaderValue::from_str(name.as_str()) {
            response.headers_mut().insert(CLIENT_NAME_HEADER, value);
        }
    }

    match level_for_status(status) {
        Level::ERROR => error!(
            method = %method,
            route = %route,
            status,
            status_class = %status_class,
            duration_ms,
            request_id = %request_id,
            "Request completed"
        ),
        Level::WARN => warn!(
            method = %method,
            route = %route,
            status,
            status_class = %status_class,
            duration_ms,
            request_id = %request_id,
            "Request completed"
        ),
        _ if opts.log_at_debug => debug!(
            method = %method,
            route = %route,
            status,
            status_class = %status_class,
            duration_ms,
            request_id = %request_id,
            "Request completed"
        ),
        _ => info!(
            method = %method,
            route = %route,
            status,
            status_class = %status_class,
            duration_ms,
            request_id = %request_id,
            "Request completed"
        ),
    }

    response
}

/// handler panic 恢复层
///
/// panic 被转换为 500 响应：记录一条 error 日志并使
/// `http_handler_panics_total` 加一，进程不退出
pub fn recovery_layer() -> CatchPanicLayer<PanicHandler> {
    CatchPanicLayer::custom(PanicHandler)
}

/// panic 转换为 500 响应的处理器
#[derive(Debug, Clone, Copy)]
pub struct PanicHandler;

impl ResponseForPanic for PanicHandler {
    type ResponseBody = axum::body::Body;

    fn response_for_panic(
        &mut self,
        err: Box<dyn Any + Send + 'static>,
    ) -> http::Response<Self::ResponseBody> {
        error!(panic = %panic_message(&err), "Panic occurred in http handler");
        counter!("http_handler_panics_total").increment(1);

        let mut response = http::Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }
}

fn panic_message(err: &Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}
