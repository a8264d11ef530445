//! 追踪器句柄。
//!
//! # 教案式说明
//! - **意图（Why）**：插桩代码需要一个可廉价克隆、可跨任务共享的入口，
//!   既能非阻塞地投递记录，又能在热路径上同步读取采样、Span 上限等设置；
//! - **逻辑（How）**：
//!   - 事件、配置命令、强制刷新、强制指标发送分别走独立通道进入事件循环；
//!   - 仅由循环消费的多字段配置以 [`ConfigCommand`] 闭包投递，按接收顺序生效；
//!   - 热路径设置（采样器、Span 上限、请求头/请求体采集、栈帧最短时长）以读写锁保护；
//!   - 统计快照由循环并入共享锁，关闭后仍可读取；
//! - **契约（What）**：任何方法都不会因代理内部失败而 panic 或向调用方传播错误，
//!   唯一的同步错误是构造期的非法服务名与缺失运行时。

mod event_loop;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};

use crate::EVENT_CHANNEL_CAPACITY;
use crate::config::{
    CaptureBodyMode, ConfigCommand, DEFAULT_POST_CONTEXT, DEFAULT_PRE_CONTEXT, TracerOptions,
    validate_service_name,
};
use crate::error::{ApmError, IngestError};
use crate::logging::Logger;
use crate::metadata::ServiceInfo;
use crate::metrics::{BuiltinMetricsGatherer, MetricsGatherer};
use crate::model::TracerEvent;
use crate::sampler::Sampler;
use crate::stacktrace::ContextSetter;
use crate::stats::TracerStats;
use crate::transport::Transport;
use crate::wildcard::Matchers;

use self::event_loop::{LoopChannels, LoopParams};

const BUILTIN_GATHERER_ID: u64 = 0;

/// `flush`/`send_metrics` 的结束方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// 循环确认相关数据已随一次完成的请求离开缓冲。
    Completed,
    /// 调用方提供的中止信号先于确认到达。
    Aborted,
    /// 追踪器已关闭或从未激活。
    Closed,
}

struct Shared {
    service: ServiceInfo,
    events: mpsc::Sender<TracerEvent>,
    config_commands: mpsc::UnboundedSender<ConfigCommand>,
    force_flush: mpsc::UnboundedSender<oneshot::Sender<()>>,
    force_send_metrics: mpsc::UnboundedSender<oneshot::Sender<()>>,
    closing: watch::Sender<bool>,
    closed: watch::Receiver<bool>,
    stats: Arc<Mutex<TracerStats>>,
    active: Arc<AtomicBool>,
    next_gatherer_id: AtomicU64,

    sampler: RwLock<Option<Arc<dyn Sampler>>>,
    max_spans: RwLock<i64>,
    capture_headers: RwLock<bool>,
    capture_body: RwLock<CaptureBodyMode>,
    span_frames_min_duration: RwLock<Duration>,
}

/// 遥测代理的入口句柄。克隆共享同一个事件循环。
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<Shared>,
}

impl Tracer {
    /// 以显式选项与传输实现构造追踪器，并在当前 Tokio 运行时上启动事件循环。
    ///
    /// # 错误
    /// - 服务名非法：[`ApmError::InvalidServiceName`]；
    /// - 选项为激活状态但不在 Tokio 运行时中：[`ApmError::NoRuntime`]。
    pub fn new(options: TracerOptions, transport: Arc<dyn Transport>) -> Result<Self, ApmError> {
        validate_service_name(&options.service_name)?;
        let runtime = if options.active {
            Some(tokio::runtime::Handle::try_current().map_err(|_| ApmError::NoRuntime)?)
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (config_tx, config_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(!options.active);
        let stats = Arc::new(Mutex::new(TracerStats::default()));
        let active = Arc::new(AtomicBool::new(options.active));

        let service = ServiceInfo {
            name: options.service_name.clone(),
            version: options.service_version.clone(),
            environment: options.service_environment.clone(),
        };

        let shared = Shared {
            service: service.clone(),
            events: events_tx,
            config_commands: config_tx.clone(),
            force_flush: flush_tx,
            force_send_metrics: metrics_tx,
            closing: closing_tx,
            closed: closed_rx,
            stats: Arc::clone(&stats),
            active: Arc::clone(&active),
            next_gatherer_id: AtomicU64::new(BUILTIN_GATHERER_ID + 1),
            sampler: RwLock::new(None),
            max_spans: RwLock::new(options.max_spans),
            capture_headers: RwLock::new(options.capture_headers),
            capture_body: RwLock::new(options.capture_body),
            span_frames_min_duration: RwLock::new(options.span_frames_min_duration),
        };

        if let Some(runtime) = runtime {
            // 首条命令写入完整配置，循环据此启动指标计时器。
            let _ = config_tx.send(initial_config(&options, Arc::clone(&stats)));
            let channels = LoopChannels {
                events: events_rx,
                config_commands: config_rx,
                force_flush: flush_rx,
                force_send_metrics: metrics_rx,
                closing: closing_rx,
            };
            let params = LoopParams {
                service,
                labels: options.global_labels.clone(),
                buffer_size: options.buffer_size,
                metrics_buffer_size: options.metrics_buffer_size,
                transport,
                stats,
            };
            runtime.spawn(event_loop::run(channels, params, active, closed_tx));
        }

        Ok(Self {
            inner: Arc::new(shared),
        })
    }

    /// 以 `SPARK_APM_*` 环境变量构造；无法解析的变量回退默认值。
    pub fn from_env(transport: Arc<dyn Transport>) -> Result<Self, ApmError> {
        Self::new(TracerOptions::from_env(), transport)
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.inner.service
    }

    /// 非阻塞投递一条已结束的记录。通道已满或追踪器已关闭时原样归还记录。
    pub fn submit(&self, event: impl Into<TracerEvent>) -> Result<(), IngestError> {
        let event = event.into();
        if !self.active() {
            return Err(IngestError::Closed(event));
        }
        self.inner.events.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(event) => IngestError::Full(event),
            mpsc::error::TrySendError::Closed(event) => IngestError::Closed(event),
        })
    }

    /// 投递一条记录，通道已满时等待空位。
    pub async fn submit_async(&self, event: impl Into<TracerEvent>) -> Result<(), IngestError> {
        let event = event.into();
        if !self.active() {
            return Err(IngestError::Closed(event));
        }
        self.inner
            .events
            .send(event)
            .await
            .map_err(|err| IngestError::Closed(err.0))
    }

    /// 关闭追踪器并等待事件循环退出。可重复调用。
    ///
    /// 在途请求的传输实现会观察到取消信号与流结束；尚未发送的缓冲数据被丢弃。
    pub async fn close(&self) {
        self.inner.closing.send_replace(true);
        self.wait_closed().await;
    }

    /// 等待调用时刻已缓冲的记录随一次完成的请求离开缓冲。
    ///
    /// 缓冲为空时立即返回；`abort` 先完成则返回 [`FlushOutcome::Aborted`]。
    pub async fn flush<F>(&self, abort: F) -> FlushOutcome
    where
        F: Future<Output = ()>,
    {
        let (reply, done) = oneshot::channel();
        if self.inner.force_flush.send(reply).is_err() {
            return FlushOutcome::Closed;
        }
        self.await_ack(done, abort).await
    }

    /// 立即采集并发送指标，等待包含本次指标的请求完成。
    pub async fn send_metrics<F>(&self, abort: F) -> FlushOutcome
    where
        F: Future<Output = ()>,
    {
        let (reply, done) = oneshot::channel();
        if self.inner.force_send_metrics.send(reply).is_err() {
            return FlushOutcome::Closed;
        }
        self.await_ack(done, abort).await
    }

    async fn await_ack<F>(&self, done: oneshot::Receiver<()>, abort: F) -> FlushOutcome
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            ack = done => match ack {
                Ok(()) => FlushOutcome::Completed,
                Err(_) => FlushOutcome::Closed,
            },
            () = abort => FlushOutcome::Aborted,
            () = self.wait_closed() => FlushOutcome::Closed,
        }
    }

    async fn wait_closed(&self) {
        let mut closed = self.inner.closed.clone();
        // 发送端被丢弃同样意味着循环已经退出。
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// 最近一次并入的累计统计，关闭后依然有效。
    pub fn stats(&self) -> TracerStats {
        *self.inner.stats.lock()
    }

    /// 事件循环是否仍在运行。
    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    fn send_config_command(&self, command: ConfigCommand) {
        // 循环退出后命令无处生效，直接丢弃。
        let _ = self.inner.config_commands.send(command);
    }

    /// 单个请求保持打开的最长时间。
    pub fn set_request_duration(&self, duration: Duration) {
        self.send_config_command(Box::new(move |cfg| cfg.request_duration = duration));
    }

    /// 单个请求的大小上限（未压缩字节）。
    pub fn set_request_size(&self, bytes: usize) {
        self.send_config_command(Box::new(move |cfg| cfg.request_size = bytes));
    }

    /// 周期性指标采集的间隔；零表示关闭。
    pub fn set_metrics_interval(&self, interval: Duration) {
        self.send_config_command(Box::new(move |cfg| cfg.metrics_interval = interval));
    }

    pub fn set_context_setter(&self, setter: Option<Arc<dyn ContextSetter>>) {
        self.send_config_command(Box::new(move |cfg| cfg.context_setter = setter));
    }

    /// 替换循环使用的日志实现；`None` 关闭循环日志。
    pub fn set_logger(&self, logger: Option<Arc<dyn Logger>>) {
        self.send_config_command(Box::new(move |cfg| cfg.logger = logger));
    }

    /// 替换脱敏名单；传入空集合表示不再脱敏任何字段。
    pub fn set_sanitized_field_names<I, S>(&self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let matchers = Matchers::parse(patterns);
        self.send_config_command(Box::new(move |cfg| cfg.sanitized_field_names = matchers));
    }

    /// 替换指标禁用名单。
    pub fn set_disabled_metrics<I, S>(&self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let matchers = Matchers::parse(patterns);
        self.send_config_command(Box::new(move |cfg| cfg.disabled_metrics = matchers));
    }

    /// 注册一个指标采集器，返回可重复调用的注销句柄。
    pub fn register_metrics_gatherer(
        &self,
        gatherer: Arc<dyn MetricsGatherer>,
    ) -> GathererRegistration {
        let id = self.inner.next_gatherer_id.fetch_add(1, Ordering::Relaxed);
        self.send_config_command(Box::new(move |cfg| {
            cfg.metrics_gatherers.push((id, gatherer));
        }));
        GathererRegistration {
            id,
            commands: self.inner.config_commands.clone(),
            deregistered: AtomicBool::new(false),
        }
    }

    pub fn set_sampler(&self, sampler: Option<Arc<dyn Sampler>>) {
        *self.inner.sampler.write() = sampler;
    }

    pub fn sampler(&self) -> Option<Arc<dyn Sampler>> {
        self.inner.sampler.read().clone()
    }

    /// 每个事务的 Span 上限；非正值表示不限制。
    pub fn set_max_spans(&self, max: i64) {
        *self.inner.max_spans.write() = max;
    }

    pub fn max_spans(&self) -> i64 {
        *self.inner.max_spans.read()
    }

    /// 已开始 `started` 个 Span 的事务能否再开始一个。
    pub fn span_allowed(&self, started: usize) -> bool {
        let max = self.max_spans();
        max <= 0 || i64::try_from(started).is_ok_and(|started| started < max)
    }

    pub fn set_capture_headers(&self, capture: bool) {
        *self.inner.capture_headers.write() = capture;
    }

    pub fn capture_headers(&self) -> bool {
        *self.inner.capture_headers.read()
    }

    pub fn set_capture_body(&self, mode: CaptureBodyMode) {
        *self.inner.capture_body.write() = mode;
    }

    pub fn capture_body(&self) -> CaptureBodyMode {
        *self.inner.capture_body.read()
    }

    /// 超过该时长的 Span 才会采集栈帧。
    pub fn set_span_frames_min_duration(&self, duration: Duration) {
        *self.inner.span_frames_min_duration.write() = duration;
    }

    pub fn span_frames_min_duration(&self) -> Duration {
        *self.inner.span_frames_min_duration.read()
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("service", &self.inner.service)
            .field("active", &self.active())
            .finish()
    }
}

/// 指标采集器的注销句柄。
#[derive(Debug)]
pub struct GathererRegistration {
    id: u64,
    commands: mpsc::UnboundedSender<ConfigCommand>,
    deregistered: AtomicBool,
}

impl GathererRegistration {
    /// 注销采集器；仅首次调用生效。
    pub fn deregister(&self) {
        if self.deregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.id;
        let _ = self.commands.send(Box::new(move |cfg| {
            cfg.metrics_gatherers.retain(|(registered, _)| *registered != id);
        }));
    }
}

fn initial_config(options: &TracerOptions, stats: Arc<Mutex<TracerStats>>) -> ConfigCommand {
    let request_duration = options.request_duration;
    let request_size = options.request_size;
    let metrics_interval = options.metrics_interval;
    let max_grace_period = options.max_grace_period;
    let sanitized = Matchers::parse(&options.sanitized_field_names);
    let disabled = Matchers::parse(&options.disabled_metrics);
    Box::new(move |cfg| {
        cfg.request_duration = request_duration;
        cfg.request_size = request_size;
        cfg.metrics_interval = metrics_interval;
        cfg.max_grace_period = max_grace_period;
        cfg.sanitized_field_names = sanitized;
        cfg.disabled_metrics = disabled;
        cfg.pre_context = DEFAULT_PRE_CONTEXT;
        cfg.post_context = DEFAULT_POST_CONTEXT;
        let builtin: Arc<dyn MetricsGatherer> = Arc::new(BuiltinMetricsGatherer::new(stats));
        cfg.metrics_gatherers = vec![(BUILTIN_GATHERER_ID, builtin)];
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DiscardTransport;

    fn inactive() -> Tracer {
        let options = TracerOptions {
            service_name: "inactive".into(),
            active: false,
            ..TracerOptions::default()
        };
        Tracer::new(options, Arc::new(DiscardTransport)).expect("未激活的追踪器无需运行时")
    }

    #[test]
    fn active_tracer_requires_a_runtime() {
        let options = TracerOptions {
            service_name: "no-runtime".into(),
            ..TracerOptions::default()
        };
        let err = Tracer::new(options, Arc::new(DiscardTransport)).expect_err("缺少运行时");
        assert!(matches!(err, ApmError::NoRuntime));
    }

    #[test]
    fn explicit_service_name_is_validated() {
        let options = TracerOptions {
            service_name: "bad:name".into(),
            active: false,
            ..TracerOptions::default()
        };
        let err = Tracer::new(options, Arc::new(DiscardTransport)).expect_err("非法服务名");
        assert!(matches!(err, ApmError::InvalidServiceName { .. }));
    }

    #[test]
    fn non_positive_max_spans_is_unlimited() {
        let tracer = inactive();
        tracer.set_max_spans(0);
        assert!(tracer.span_allowed(10_000));
        tracer.set_max_spans(-1);
        assert!(tracer.span_allowed(usize::MAX));
        tracer.set_max_spans(2);
        assert!(tracer.span_allowed(1));
        assert!(!tracer.span_allowed(2));
    }

    #[test]
    fn hot_path_settings_round_trip() {
        let tracer = inactive();
        tracer.set_capture_headers(false);
        tracer.set_capture_body(CaptureBodyMode::All);
        tracer.set_span_frames_min_duration(Duration::from_millis(20));
        tracer.set_sampler(Some(Arc::new(|_: crate::model::TraceId| false)));
        assert!(!tracer.capture_headers());
        assert_eq!(tracer.capture_body(), CaptureBodyMode::All);
        assert_eq!(tracer.span_frames_min_duration(), Duration::from_millis(20));
        let sampler = tracer.sampler().expect("采样器已设置");
        assert!(!sampler.sample(crate::model::TraceId::default()));
    }

    #[tokio::test]
    async fn inactive_tracer_rejects_work_without_blocking() {
        let tracer = inactive();
        assert!(!tracer.active());
        let event = crate::model::Transaction::default();
        assert!(matches!(tracer.submit(event), Err(IngestError::Closed(_))));
        assert_eq!(
            tracer.flush(std::future::pending()).await,
            FlushOutcome::Closed
        );
        assert_eq!(
            tracer.send_metrics(std::future::pending()).await,
            FlushOutcome::Closed
        );
        tracer.close().await;
        assert!(tracer.stats().is_zero());
    }
}
