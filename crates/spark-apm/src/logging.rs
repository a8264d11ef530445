//! 日志能力。
//!
//! # 教案式说明
//! - **意图（Why）**：事件循环需要一个可在运行时替换的日志出口（`Tracer::set_logger`），
//!   同时默认行为应直接融入宿主已有的 `tracing` 生态；
//! - **逻辑（How）**：[`Logger`] 是对象安全的最小契约，[`TracingLogger`] 将其转发到 `tracing` 宏；
//!   [`init_default_subscriber`] 按 `RUST_LOG`（缺省 `info`）组装 `fmt + EnvFilter` 订阅器；
//! - **契约（What）**：日志实现必须线程安全且不得 panic，事件循环会在热路径之外调用它。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::ApmError;

/// 事件循环使用的日志契约。
pub trait Logger: Send + Sync + 'static {
    fn debug(&self, message: &str);
    fn error(&self, message: &str);
}

/// 转发到 `tracing` 的默认日志实现，目标为 `spark_apm`。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "spark_apm", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "spark_apm", "{message}");
    }
}

/// 安装全局 `fmt` 订阅器。
///
/// 已存在全局订阅器时返回 [`ApmError::Subscriber`]，不会覆盖宿主配置。
pub fn init_default_subscriber() -> Result<(), ApmError> {
    tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| ApmError::Subscriber(err.to_string()))
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
