//! argus 配置加载
//!
//! TOML 文件与 OBSERVER_ 前缀环境变量合并，环境变量优先

use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::error::ObserverResult;

/// Logger 配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// debug | info | warn | error；"none" 或无法识别的值会关闭日志输出
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Prometheus 配置
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Tracer 配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TracerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OTLP collector 的 gRPC 地址
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otlp_endpoint(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

/// Observer 配置
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ObserverConfig {
    /// 服务名称，同时作为出站请求的 client-name
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub region: String,
    /// 附加到 trace resource 上的自由标签
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub tracer: TracerConfig,
}

impl ObserverConfig {
    /// 创建一个只有服务名称的配置，其余通过 with_* 方法补充
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 从配置目录和环境变量加载配置
    ///
    /// 读取 `{config_dir}/observer.toml`，再用 OBSERVER_ 前缀的环境变量覆盖
    pub fn load(config_dir: &str) -> ObserverResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(format!("{}/observer.toml", config_dir)))
            .merge(Env::prefixed("OBSERVER_").split("_"))
            .extract()?;

        Ok(config)
    }

    /// 仅从环境变量加载配置
    pub fn from_env() -> ObserverResult<Self> {
        let config: Self = Figment::new()
            .merge(Env::prefixed("OBSERVER_").split("_"))
            .extract()?;

        Ok(config)
    }

    /// 设置服务元数据，空值保持原样
    pub fn with_metadata(
        mut self,
        version: &str,
        environment: &str,
        region: &str,
        tags: HashMap<String, String>,
    ) -> Self {
        if !version.is_empty() {
            self.version = version.to_string();
        }
        if !environment.is_empty() {
            self.environment = environment.to_string();
        }
        if !region.is_empty() {
            self.region = region.to_string();
        }
        if !tags.is_empty() {
            self.tags = tags;
        }
        self
    }

    /// 启用日志，空 level 使用默认值
    pub fn with_logger(mut self, level: &str) -> Self {
        self.logger.enabled = true;
        if !level.is_empty() {
            self.logger.level = level.to_string();
        }
        self
    }

    /// 启用 Prometheus metrics
    pub fn with_prometheus(mut self) -> Self {
        self.prometheus.enabled = true;
        self
    }

    /// 启用 OTLP tracing，空 endpoint 使用默认值
    pub fn with_tracer(mut self, endpoint: &str) -> Self {
        self.tracer.enabled = true;
        if !endpoint.is_empty() {
            self.tracer.endpoint = endpoint.to_string();
        }
        self
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
