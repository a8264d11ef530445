//! `spark-apm` 是嵌入宿主进程的遥测代理核心。
//!
//! # 模块定位（Why）
//! - 插桩代码在请求热路径上产生事务、Span 与错误记录；代理负责把它们缓冲、压缩并推送给采集端，
//!   且无论采集端多慢、多不可用，都不能拖慢或阻塞宿主进程；
//! - 网络发送以 [`Transport`] trait 抽象，代理核心不绑定任何具体协议，
//!   TCP 实现见 `spark-apm-transport-tcp`。
//!
//! # 设计概要（How）
//! - [`Tracer`] 是对外句柄：事件经有界通道（容量 [`EVENT_CHANNEL_CAPACITY`]）投递给唯一的事件循环任务；
//! - 事件循环独占两个环形缓冲（追踪数据与指标），容量不足时淘汰最旧块并计入丢弃统计；
//! - 缓冲中的块被增量写入 zlib 压缩流，由请求驱动任务交给 [`Transport`] 发送；
//!   失败后按宽限期退避（见 [`next_grace_period`]），从不让错误冒泡到插桩调用点；
//! - 指标由已注册的 [`MetricsGatherer`] 周期性并发采集，写入独立的指标缓冲。
//!
//! # 契约说明（What）
//! - 热路径操作（[`Tracer::submit`]、采样器与 Span 上限查询）均为非阻塞；
//! - 任意时刻至多一个请求在途，单个请求的未压缩大小与打开时长都有上限；
//! - 关闭后所有操作立即返回，统计快照依然可读。

pub mod config;
pub mod logging;

mod assembler;
mod driver;
mod error;
mod metadata;
mod metrics;
mod model;
mod sampler;
mod stacktrace;
mod stats;
mod stream;
mod tracer;
mod transport;
mod wildcard;
mod writer;

/// 事件通道容量；通道已满时 [`Tracer::submit`] 立即返回 [`IngestError::Full`]。
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

pub use config::{CaptureBodyMode, TracerOptions};
pub use driver::{GRACE_PERIOD_JITTER, jitter_duration, next_grace_period};
pub use error::{ApmError, GatherError, IngestError, TransportError};
pub use logging::{Logger, TracingLogger, init_default_subscriber};
pub use metadata::{AGENT_NAME, AGENT_VERSION, ServiceInfo};
pub use metrics::{Metrics, MetricsGatherer, Metricset, Sample};
pub use model::{
    ErrorLog, ErrorRecord, Exception, RequestContext, Span, SpanCount, SpanId, StackFrame, TraceId,
    Transaction, TransactionContext, TracerEvent, now_micros,
};
pub use sampler::Sampler;
pub use stacktrace::{ContextSetter, FileContextSetter};
pub use stats::{TracerStats, TracerStatsErrors};
pub use stream::StreamReader;
pub use tracer::{FlushOutcome, GathererRegistration, Tracer};
pub use transport::{CancelHandle, Cancellation, DiscardTransport, Transport};
pub use wildcard::{Matcher, Matchers};
pub use writer::REDACTED;
