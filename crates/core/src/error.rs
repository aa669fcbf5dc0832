//! argus 错误类型

use thiserror::Error;

/// Observer 构建与关闭错误
///
/// 请求级别的错误不在此列：中间件和拦截层只观测并原样传递它们
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("Failed to load config: {0}")]
    Config(#[from] figment::Error),

    #[error("Failed to initialize logger: {0}")]
    Logger(String),

    #[error("Failed to install Prometheus recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Failed to build the OTLP exporter: {0}")]
    Trace(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("Failed to shut down tracer provider: {0}")]
    Shutdown(String),
}

/// Result 类型别名
pub type ObserverResult<T> = Result<T, ObserverError>;
