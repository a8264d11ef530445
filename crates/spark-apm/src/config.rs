//! 追踪器配置。
//!
//! # 教案式说明
//! - **意图（Why）**：构造期选项与运行期配置分属两个所有者：
//!   [`TracerOptions`] 由调用方组装（代码、环境变量或 TOML），[`TracerConfig`] 则由事件循环独占，
//!   只能通过 [`ConfigCommand`] 闭包按接收顺序修改；
//! - **逻辑（How）**：环境变量与 TOML 共享同一套“人性化”解析（`"10s"`、`"750KB"`），
//!   宽松模式下逐项回退默认值并输出 warn 日志，严格模式返回第一个 [`ApmError::Config`]；
//! - **契约（What）**：显式传入的非法服务名始终是致命错误，见 [`validate_service_name`]。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ApmError;
use crate::logging::{Logger, TracingLogger};
use crate::metrics::MetricsGatherer;
use crate::stacktrace::ContextSetter;
use crate::wildcard::Matchers;

pub const DEFAULT_REQUEST_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_SIZE: usize = 750 * 1024;
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_METRICS_BUFFER_SIZE: usize = 100 * 1024;
pub const DEFAULT_MAX_SPANS: i64 = 500;
pub const DEFAULT_SPAN_FRAMES_MIN_DURATION: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_GRACE_PERIOD: Duration = Duration::from_secs(36);
pub const DEFAULT_PRE_CONTEXT: usize = 3;
pub const DEFAULT_POST_CONTEXT: usize = 3;

pub const DEFAULT_SANITIZED_FIELD_NAMES: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "*key",
    "*token*",
    "*session*",
    "*credit*",
    "*card*",
    "authorization",
    "set-cookie",
];

const FALLBACK_SERVICE_NAME: &str = "unknown-rust-service";

/// 环境变量名集中定义，便于文档与测试引用。
pub mod env {
    pub const SERVICE_NAME: &str = "SPARK_APM_SERVICE_NAME";
    pub const SERVICE_VERSION: &str = "SPARK_APM_SERVICE_VERSION";
    pub const ENVIRONMENT: &str = "SPARK_APM_ENVIRONMENT";
    pub const REQUEST_DURATION: &str = "SPARK_APM_API_REQUEST_TIME";
    pub const METRICS_INTERVAL: &str = "SPARK_APM_METRICS_INTERVAL";
    pub const REQUEST_SIZE: &str = "SPARK_APM_API_REQUEST_SIZE";
    pub const BUFFER_SIZE: &str = "SPARK_APM_API_BUFFER_SIZE";
    pub const METRICS_BUFFER_SIZE: &str = "SPARK_APM_METRICS_BUFFER_SIZE";
    pub const MAX_SPANS: &str = "SPARK_APM_TRANSACTION_MAX_SPANS";
    pub const CAPTURE_HEADERS: &str = "SPARK_APM_CAPTURE_HEADERS";
    pub const CAPTURE_BODY: &str = "SPARK_APM_CAPTURE_BODY";
    pub const SPAN_FRAMES_MIN_DURATION: &str = "SPARK_APM_SPAN_FRAMES_MIN_DURATION";
    pub const SANITIZE_FIELD_NAMES: &str = "SPARK_APM_SANITIZE_FIELD_NAMES";
    pub const DISABLE_METRICS: &str = "SPARK_APM_DISABLE_METRICS";
    pub const GLOBAL_LABELS: &str = "SPARK_APM_GLOBAL_LABELS";
    pub const ACTIVE: &str = "SPARK_APM_ACTIVE";
    pub const MAX_GRACE_PERIOD: &str = "SPARK_APM_MAX_GRACE_PERIOD";
}

/// HTTP 请求体采集模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBodyMode {
    #[default]
    Off,
    Errors,
    Transactions,
    All,
}

impl CaptureBodyMode {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(CaptureBodyMode::Off),
            "errors" => Ok(CaptureBodyMode::Errors),
            "transactions" => Ok(CaptureBodyMode::Transactions),
            "all" => Ok(CaptureBodyMode::All),
            other => Err(format!(
                "unknown capture body mode `{other}`, expected off, errors, transactions or all"
            )),
        }
    }
}

/// 构造期选项。
///
/// # 契约说明（What）
/// - `metrics_interval` 为零表示关闭周期性指标采集（`send_metrics` 仍可用）；
/// - `max_spans` 非正值表示不限制；
/// - 缓冲容量在构造后不可调整，请求大小与请求时长可在运行期通过追踪器修改。
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerOptions {
    pub service_name: String,
    pub service_version: Option<String>,
    pub service_environment: Option<String>,
    #[serde(deserialize_with = "de_duration")]
    pub request_duration: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub metrics_interval: Duration,
    #[serde(deserialize_with = "de_size")]
    pub request_size: usize,
    #[serde(deserialize_with = "de_size")]
    pub buffer_size: usize,
    #[serde(deserialize_with = "de_size")]
    pub metrics_buffer_size: usize,
    pub max_spans: i64,
    pub capture_headers: bool,
    pub capture_body: CaptureBodyMode,
    #[serde(deserialize_with = "de_duration")]
    pub span_frames_min_duration: Duration,
    pub sanitized_field_names: Vec<String>,
    pub disabled_metrics: Vec<String>,
    pub global_labels: BTreeMap<String, String>,
    pub active: bool,
    #[serde(deserialize_with = "de_duration")]
    pub max_grace_period: Duration,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            service_version: None,
            service_environment: None,
            request_duration: DEFAULT_REQUEST_DURATION,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            request_size: DEFAULT_REQUEST_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            metrics_buffer_size: DEFAULT_METRICS_BUFFER_SIZE,
            max_spans: DEFAULT_MAX_SPANS,
            capture_headers: true,
            capture_body: CaptureBodyMode::Off,
            span_frames_min_duration: DEFAULT_SPAN_FRAMES_MIN_DURATION,
            sanitized_field_names: DEFAULT_SANITIZED_FIELD_NAMES
                .iter()
                .map(|pattern| (*pattern).to_owned())
                .collect(),
            disabled_metrics: Vec::new(),
            global_labels: BTreeMap::new(),
            active: true,
            max_grace_period: DEFAULT_MAX_GRACE_PERIOD,
        }
    }
}

impl TracerOptions {
    /// 读取 `SPARK_APM_*` 环境变量；无法解析的值记录 warn 日志后回退默认值。
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 与 [`TracerOptions::from_env`] 相同，但遇到第一个非法值即返回错误。
    pub fn try_from_env() -> Result<Self, ApmError> {
        Self::try_from_lookup(|key| std::env::var(key).ok())
    }

    /// 以自定义查找函数代替进程环境（严格模式），便于测试与嵌入式配置源。
    pub fn try_from_lookup<F>(lookup: F) -> Result<Self, ApmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        EnvReader {
            lookup,
            strict: true,
        }
        .load()
    }

    /// 宽松模式的自定义查找版本。
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // 宽松模式下 `load` 不会返回错误。
        EnvReader {
            lookup,
            strict: false,
        }
        .load()
        .unwrap_or_default()
    }

    /// 从 TOML 文本加载；缺省字段取默认值，未知字段视为错误。
    pub fn from_toml_str(text: &str) -> Result<Self, ApmError> {
        let options: TracerOptions =
            toml::from_str(text).map_err(|err| ApmError::config("toml", err.to_string()))?;
        validate_service_name(&options.service_name)?;
        Ok(options)
    }
}

struct EnvReader<F> {
    lookup: F,
    strict: bool,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn load(&self) -> Result<TracerOptions, ApmError> {
        let mut opts = TracerOptions::default();
        self.read(env::SERVICE_NAME, &mut opts.service_name, |raw| {
            validate_service_name(raw)
                .map(|()| raw.to_owned())
                .map_err(|err| err.to_string())
        })?;
        self.read(env::SERVICE_VERSION, &mut opts.service_version, |raw| {
            Ok(Some(raw.to_owned()))
        })?;
        self.read(env::ENVIRONMENT, &mut opts.service_environment, |raw| {
            Ok(Some(raw.to_owned()))
        })?;
        self.read(env::REQUEST_DURATION, &mut opts.request_duration, parse_duration)?;
        self.read(env::METRICS_INTERVAL, &mut opts.metrics_interval, parse_duration)?;
        self.read(env::REQUEST_SIZE, &mut opts.request_size, parse_size)?;
        self.read(env::BUFFER_SIZE, &mut opts.buffer_size, parse_size)?;
        self.read(env::METRICS_BUFFER_SIZE, &mut opts.metrics_buffer_size, parse_size)?;
        self.read(env::MAX_SPANS, &mut opts.max_spans, |raw| {
            raw.trim().parse::<i64>().map_err(|err| err.to_string())
        })?;
        self.read(env::CAPTURE_HEADERS, &mut opts.capture_headers, parse_bool)?;
        self.read(env::CAPTURE_BODY, &mut opts.capture_body, CaptureBodyMode::parse)?;
        self.read(
            env::SPAN_FRAMES_MIN_DURATION,
            &mut opts.span_frames_min_duration,
            parse_duration,
        )?;
        self.read(env::SANITIZE_FIELD_NAMES, &mut opts.sanitized_field_names, |raw| {
            Ok(parse_list(raw))
        })?;
        self.read(env::DISABLE_METRICS, &mut opts.disabled_metrics, |raw| {
            Ok(parse_list(raw))
        })?;
        self.read(env::GLOBAL_LABELS, &mut opts.global_labels, parse_labels)?;
        self.read(env::ACTIVE, &mut opts.active, parse_bool)?;
        self.read(env::MAX_GRACE_PERIOD, &mut opts.max_grace_period, parse_duration)?;
        Ok(opts)
    }

    fn read<T>(
        &self,
        key: &str,
        slot: &mut T,
        parse: impl FnOnce(&str) -> Result<T, String>,
    ) -> Result<(), ApmError> {
        let Some(raw) = (self.lookup)(key) else {
            return Ok(());
        };
        if raw.trim().is_empty() {
            return Ok(());
        }
        match parse(&raw) {
            Ok(value) => {
                *slot = value;
                Ok(())
            }
            Err(reason) => {
                let err = ApmError::config(key, reason);
                if self.strict {
                    return Err(err);
                }
                tracing::warn!(target: "spark_apm", error = %err, "using default value");
                Ok(())
            }
        }
    }
}

/// 服务名只允许 ASCII 字母、数字、`_`、`-` 与空格，且不可为空。
pub fn validate_service_name(name: &str) -> Result<(), ApmError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' '));
    if valid {
        Ok(())
    } else {
        Err(ApmError::InvalidServiceName {
            name: name.to_owned(),
        })
    }
}

fn default_service_name() -> String {
    let name: String = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        FALLBACK_SERVICE_NAME.to_owned()
    } else {
        name
    }
}

/// 解析时长：`ms`/`s`/`m`/`h` 后缀，无后缀按秒计。
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let text = raw.trim().to_ascii_lowercase();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration `{raw}`"))?;
    let scale = match unit.trim() {
        "ms" => 0.001,
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        other => return Err(format!("unknown duration unit `{other}` in `{raw}`")),
    };
    Duration::try_from_secs_f64(value * scale).map_err(|err| format!("invalid duration `{raw}`: {err}"))
}

/// 解析字节大小：`B`/`KB`/`MB`/`GB` 后缀（1024 进制），无后缀按字节计。
pub fn parse_size(raw: &str) -> Result<usize, String> {
    let text = raw.trim().to_ascii_uppercase();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: usize = number.parse().map_err(|_| format!("invalid size `{raw}`"))?;
    let scale: usize = match unit.trim() {
        "" | "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit `{other}` in `{raw}`")),
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| format!("size `{raw}` overflows"))
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!("invalid boolean `{raw}`")),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>, String> {
    parse_list(raw)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_owned(), value.trim().to_owned()))
            }
            _ => Err(format!("invalid label `{pair}`, expected key=value")),
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Humanised {
    Text(String),
    Number(u64),
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match Humanised::deserialize(deserializer)? {
        Humanised::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        Humanised::Number(secs) => Ok(Duration::from_secs(secs)),
    }
}

fn de_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    match Humanised::deserialize(deserializer)? {
        Humanised::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
        Humanised::Number(bytes) => usize::try_from(bytes).map_err(serde::de::Error::custom),
    }
}

/// 事件循环独占的运行期配置。
///
/// # 教案式说明
/// - **意图（Why）**：多字段联动（例如指标周期与计时器重排）必须无毛刺地一次生效，
///   因此不用锁，而由循环按接收顺序执行 [`ConfigCommand`]；
/// - **契约（What）**：外部只能经由 `Tracer` 的 setter 投递命令，从不直接持有引用。
pub struct TracerConfig {
    pub(crate) request_duration: Duration,
    pub(crate) request_size: usize,
    pub(crate) metrics_interval: Duration,
    pub(crate) max_grace_period: Duration,
    pub(crate) sanitized_field_names: Matchers,
    pub(crate) disabled_metrics: Matchers,
    pub(crate) logger: Option<Arc<dyn Logger>>,
    pub(crate) context_setter: Option<Arc<dyn ContextSetter>>,
    pub(crate) pre_context: usize,
    pub(crate) post_context: usize,
    pub(crate) metrics_gatherers: Vec<(u64, Arc<dyn MetricsGatherer>)>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            request_duration: DEFAULT_REQUEST_DURATION,
            request_size: DEFAULT_REQUEST_SIZE,
            // 初始为零，首条命令写入真实周期时才会启动计时器。
            metrics_interval: Duration::ZERO,
            max_grace_period: DEFAULT_MAX_GRACE_PERIOD,
            sanitized_field_names: Matchers::default(),
            disabled_metrics: Matchers::default(),
            logger: Some(Arc::new(TracingLogger)),
            context_setter: None,
            pre_context: DEFAULT_PRE_CONTEXT,
            post_context: DEFAULT_POST_CONTEXT,
            metrics_gatherers: Vec::new(),
        }
    }
}

/// 在事件循环内执行的配置变更。
pub type ConfigCommand = Box<dyn FnOnce(&mut TracerConfig) + Send>;
