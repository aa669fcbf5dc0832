//! Observer facade
//!
//! 在一个结构中初始化并持有三大支柱：
//! - logger：tracing-subscriber（生产环境 JSON 输出）
//! - meter：metrics-exporter-prometheus 的拉取式 scrape 端点
//! - tracer：OTLP batch exporter + W3C trace context 传播
//!
//! Observer 在进程启动时构建一次，显式传递给需要它的中间件与拦截层，
//! 进程退出前调用 shutdown 刷新 tracer

use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider, Resource};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::ObserverConfig;
use crate::error::{ObserverError, ObserverResult};

/// 可观测性 facade
///
/// 进程生命周期对象：构建时初始化，只在 shutdown 时再次变更
#[derive(Clone)]
pub struct Observer {
    name: String,
    version: String,
    prometheus: Option<PrometheusHandle>,
    tracer_provider: Option<SdkTracerProvider>,
    log_filter: Option<reload::Handle<EnvFilter, Registry>>,
}

impl Observer {
    /// 根据配置构建 Observer
    ///
    /// 初始化失败视为致命错误，由调用方决定如何终止
    pub fn new(config: ObserverConfig) -> ObserverResult<Self> {
        // tracer 先于 logger 初始化，logger 的 otel layer 依赖它
        let tracer_provider = if config.tracer.enabled {
            Some(init_tracer(&config)?)
        } else {
            None
        };

        let log_filter = if config.logger.enabled {
            Some(init_logger(&config, tracer_provider.as_ref())?)
        } else {
            None
        };

        let prometheus = if config.prometheus.enabled {
            Some(PrometheusBuilder::new().install_recorder()?)
        } else {
            None
        };

        info!(
            name = %config.name,
            environment = %config.environment,
            "Observer initialized"
        );

        Ok(Self {
            name: config.name,
            version: config.version,
            prometheus,
            tracer_provider,
            log_filter,
        })
    }

    /// 运行时调整日志级别
    ///
    /// 级别字符串的解释与配置一致，"none" 或无法识别的值关闭输出；
    /// logger 未启用时是无操作
    pub fn set_log_level(&self, level: &str) -> ObserverResult<()> {
        if let Some(handle) = &self.log_filter {
            handle
                .reload(log_filter(level))
                .map_err(|e| ObserverError::Logger(e.to_string()))?;
        }
        Ok(())
    }

    /// 当前生效的日志过滤级别；logger 未启用时返回 None
    pub fn log_level(&self) -> Option<String> {
        self.log_filter
            .as_ref()
            .and_then(|handle| handle.with_current(|filter| filter.to_string()).ok())
    }

    /// 服务名称，出站请求以此作为 client-name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 渲染 Prometheus 文本格式的 metrics；未启用时返回空串
    pub fn metrics_text(&self) -> String {
        self.prometheus
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }

    /// /metrics 与 /health 路由
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(self.clone())
    }

    /// 启动 metrics/health HTTP 服务器
    pub async fn serve(self, port: u16) -> Result<(), std::io::Error> {
        let app = self.routes();

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        info!(%addr, "Observer HTTP server starting");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await
    }

    /// 刷新并关闭 tracer provider
    pub fn shutdown(&self) -> ObserverResult<()> {
        if let Some(provider) = &self.tracer_provider {
            provider
                .force_flush()
                .map_err(|e| ObserverError::Shutdown(e.to_string()))?;
            provider
                .shutdown()
                .map_err(|e| ObserverError::Shutdown(e.to_string()))?;
        }
        Ok(())
    }
}

/// 初始化 tracing subscriber，返回运行时调整级别用的 reload 句柄
fn init_logger(
    config: &ObserverConfig,
    tracer_provider: Option<&SdkTracerProvider>,
) -> ObserverResult<reload::Handle<EnvFilter, Registry>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter(&config.logger.level));
    let (filter, handle) = reload::Layer::new(filter);

    let fmt_layer = if config.is_production() {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let otel_layer = tracer_provider.map(|provider| {
        use opentelemetry::trace::TracerProvider as _;
        tracing_opentelemetry::layer()
            .with_tracer(provider.tracer("argus"))
            .boxed()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| ObserverError::Logger(e.to_string()))?;

    Ok(handle)
}

/// 将配置的日志级别映射为 EnvFilter
///
/// "none" 和无法识别的值关闭日志输出
pub(crate) fn log_filter(level: &str) -> EnvFilter {
    match level {
        "debug" | "info" | "warn" | "error" => EnvFilter::new(level),
        _ => EnvFilter::new("off"),
    }
}

/// 初始化 OTLP tracer provider 并注册全局 propagator
fn init_tracer(config: &ObserverConfig) -> ObserverResult<SdkTracerProvider> {
    let mut attributes = vec![
        KeyValue::new("service.version", config.version.clone()),
        KeyValue::new("deployment.environment.name", config.environment.clone()),
        KeyValue::new("cloud.region", config.region.clone()),
    ];
    for (key, value) in &config.tags {
        attributes.push(KeyValue::new(key.clone(), value.clone()));
    }

    let resource = Resource::builder()
        .with_service_name(config.name.clone())
        .with_attributes(attributes)
        .build();

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.tracer.endpoint.clone())
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build();

    global::set_text_map_propagator(TraceContextPropagator::new());
    global::set_tracer_provider(provider.clone());

    Ok(provider)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Liveness 端点处理器
async fn health_handler(State(observer): State<Observer>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: observer.version.clone(),
        }),
    )
}

/// Metrics 端点处理器
async fn metrics_handler(State(observer): State<Observer>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        observer.metrics_text(),
    )
}
