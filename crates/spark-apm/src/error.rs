//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义代理对外暴露的错误语义；
//! - 区分“构造期致命错误”（同步返回给调用方）与“运行期可恢复错误”（被事件循环吸收为统计与重试状态）。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 [`thiserror::Error`]；
//! - 事件循环内部的失败从不越过插桩调用点：传输错误只进入统计与日志，序列化失败只进入丢弃计数。

use std::io;

use thiserror::Error;

use crate::model::TracerEvent;

/// 代理构造与配置层的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：仅覆盖调用方能够同步感知并修正的失败，例如显式传入的服务名非法；
/// - **契约 (What)**：环境变量来源的配置在宽松模式下不会产生该错误，而是记录告警并回退默认值。
#[derive(Debug, Error)]
pub enum ApmError {
    /// 服务名为空或包含 `[A-Za-z0-9 _-]` 之外的字符。
    #[error("invalid service name `{name}`: only letters, digits, '_', '-' and ' ' are allowed")]
    InvalidServiceName { name: String },

    /// 构造追踪器时不在 Tokio 运行时上下文中。
    #[error("a tokio runtime is required to start the tracer loop")]
    NoRuntime,

    /// 某个配置项无法解析。
    #[error("failed to parse {key}: {reason}")]
    Config { key: String, reason: String },

    /// 全局 tracing Subscriber 已被其他组件设置。
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

impl ApmError {
    pub(crate) fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ApmError::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// 传输能力返回的错误。
///
/// 日志级别取决于变体：[`TransportError::VersionMismatch`] 通常意味着采集端版本过旧，
/// 属于部署问题，以 error 级别输出；其余失败以 debug 级别输出并进入退避重试。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 采集端拒绝请求，且状态码表明很可能是协议版本不匹配。
    #[error("collector rejected the stream (status {status}), likely a version mismatch: {message}")]
    VersionMismatch { status: u16, message: String },

    /// 采集端以非成功状态拒绝请求。
    #[error("collector rejected the stream (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// 底层 IO 失败。
    #[error("stream transport failed: {0}")]
    Io(#[from] io::Error),

    /// 发送任务异常终止（例如传输实现 panic）。
    #[error("send task aborted: {0}")]
    Aborted(String),
}

impl TransportError {
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, TransportError::VersionMismatch { .. })
    }
}

/// 非阻塞投递事件失败时，原样归还事件。
#[derive(Debug, Error)]
pub enum IngestError {
    /// 事件通道已满（容量见 [`crate::EVENT_CHANNEL_CAPACITY`]）。
    #[error("tracer event channel is full")]
    Full(TracerEvent),
    /// 追踪器已关闭或未激活。
    #[error("tracer is closed")]
    Closed(TracerEvent),
}

impl IngestError {
    pub fn into_event(self) -> TracerEvent {
        match self {
            IngestError::Full(event) | IngestError::Closed(event) => event,
        }
    }
}

/// 指标采集器的失败，仅记录日志，不影响其他采集器。
#[derive(Debug, Error)]
#[error("metrics gatherer failed: {0}")]
pub struct GatherError(pub String);
