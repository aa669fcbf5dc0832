//! 可观测 HTTP 客户端
//!
//! 包装 reqwest：每次出站请求自动传播关联 ID、附带调用方名称、
//! 注入 trace context，并记录请求数 / 时长指标与一条结构化日志

use std::time::Instant;

use http::HeaderValue;
use metrics::{counter, histogram};
use tracing::{debug, error, info, info_span, warn, Instrument, Level};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use argus_core::{
    inject_context, Observer, RequestId, CLIENT_NAME_HEADER, REQUEST_ID_HEADER,
};

use crate::level_for_status;
use crate::route::normalize_route_with;

/// 客户端可选配置
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// 成功请求记录在 debug 级别（默认 info）
    pub log_at_debug: bool,
    /// 自定义 id 段模式，替代默认的 uuid / 数字判定
    pub id_pattern: Option<regex::Regex>,
}

/// 可观测 HTTP 客户端
///
/// 以 Observer 的服务名作为 client-name 发送给对端
#[derive(Clone)]
pub struct Client {
    inner: reqwest::Client,
    name: String,
    opts: ClientOptions,
}

impl Client {
    pub fn new(observer: &Observer) -> Self {
        Self::with_options(observer, ClientOptions::default())
    }

    pub fn with_options(observer: &Observer, opts: ClientOptions) -> Self {
        Self::from_parts(reqwest::Client::new(), observer.name(), opts)
    }

    /// 复用已配置好的 reqwest 客户端
    pub fn from_parts(
        inner: reqwest::Client,
        name: impl Into<String>,
        opts: ClientOptions,
    ) -> Self {
        Self {
            inner,
            name: name.into(),
            opts,
        }
    }

    /// 为出站请求补齐观测所需的请求头
    ///
    /// 已有的关联 ID 保持不变，缺失时生成新的；client-name 总是
    /// 覆盖为本服务名；当前 span 的 trace context 注入请求头
    pub fn prepare(&self, request: &mut reqwest::Request) -> RequestId {
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
        if let Ok(value) = HeaderValue::from_str(&self.name) {
            request.headers_mut().insert(CLIENT_NAME_HEADER, value);
        }

        let cx = tracing::Span::current().context();
        inject_context(&cx, request.headers_mut());

        request_id
    }

    /// 发送请求并记录观测数据
    ///
    /// 传输层错误（连接失败、超时）以 status_code = -1 计入指标
    pub async fn execute(&self, mut request: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let start = Instant::now();
        let method = request.method().to_string();
        let route = normalize_route_with(request.url().path(), self.opts.id_pattern.as_ref());

        let span = info_span!(
            "http_client_request",
            otel.kind = "client",
            http.method = %method,
            http.route = %route,
            request_id = tracing::field::Empty,
            http.status_code = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
        );
        let request_id = {
            let _enter = span.enter();
            self.prepare(&mut request)
        };
        span.record("request_id", request_id.as_str());

        let result = self.inner.execute(request).instrument(span.clone()).await;

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let status: i64 = match &result {
            Ok(response) => i64::from(response.status().as_u16()),
            Err(_) => -1,
        };
        let status_class = if status >= 0 {
            format!("{}xx", status / 100)
        } else {
            String::new()
        };

        let labels = [
            ("method", method.clone()),
            ("route", route.clone()),
            ("status_code", status.to_string()),
            ("status_class", status_class),
        ];
        counter!("outgoing_http_requests_total", &labels).increment(1);
        histogram!("outgoing_http_requests_duration_ms", &labels).record(duration_ms);

        span.record("http.status_code", status);
        if status >= 500 || status < 0 {
            span.record("otel.status_code", "ERROR");
        }

        let level = if status < 0 {
            Level::ERROR
        } else {
            level_for_status(status as u16)
        };
        match level {
            Level::ERROR => error!(
                method = %method,
                route = %route,
                status,
                duration_ms,
                request_id = %request_id,
                "Request sent"
            ),
            Level::WARN => warn!(
                method = %method,
                route = %route,
                status,
                duration_ms,
                request_id = %request_id,
                "Request sent"
            ),
            _ if self.opts.log_at_debug => debug!(
                method = %method,
                route = %route,
                status,
                duration_ms,
                request_id = %request_id,
                "Request sent"
            ),
            _ => info!(
                method = %method,
                route = %route,
                status,
                duration_ms,
                request_id = %request_id,
                "Request sent"
            ),
        }

        result
    }

    pub async fn get(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        let request = self.inner.get(url).build()?;
        self.execute(request).await
    }

    pub async fn post(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        let request = self.inner.post(url).build()?;
        self.execute(request).await
    }

    /// 构建任意方法的请求，完成后交给 [`Client::execute`] 发送
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.inner.request(method, url)
    }
}
