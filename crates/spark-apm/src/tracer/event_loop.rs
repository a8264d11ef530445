//! 事件循环：代理唯一的协调任务。
//!
//! # 教案式说明
//! - **意图（Why）**：缓冲、运行期配置与请求生命周期只由一个任务触碰，因此无需任何锁；
//!   其他任务（插桩调用点、请求驱动、指标采集）全部经由通道与之交互；
//! - **逻辑（How）**：每轮迭代只处理一个输入（关闭、事件、配置命令、请求计时器、指标计时器、
//!   强制指标、采集完成、强制刷新、读请求、发送结果），随后统一执行：
//!   1. 搬运淘汰计数并把本轮统计并入共享快照；
//!   2. 需要时启动一轮指标采集（同一时刻至多一轮）；
//!   3. 结算已满足条件的刷新/指标等待者；
//!   4. 空闲且有数据时打开新请求，并把缓冲中的块写入当前请求，直到达到大小上限；
//!   5. 按需同步刷新或结束压缩流，并应答未决的读请求；
//! - **契约（What）**：
//!   - 请求状态机：空闲 → 打开 → 流式写入 → 收尾 → 完成/失败 → 空闲；
//!   - 至多一个请求在途；失败只推进宽限期并计数，从不中断循环；
//!   - 关闭时先触发取消信号，再以 EOF 应答未决读请求，在途请求因此优雅结束。

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_ringbuffer::{BlockHeader, RingBuffer};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};

use crate::assembler::StreamAssembler;
use crate::config::{ConfigCommand, TracerConfig};
use crate::driver::{SendRequest, next_grace_period, spawn_request_driver};
use crate::error::TransportError;
use crate::metadata::{ServiceInfo, encode_metadata};
use crate::metrics::{Metrics, spawn_gather};
use crate::model::TracerEvent;
use crate::stats::{EvictionTally, TracerStats};
use crate::stream::{ReadChunk, ReadRequest, StreamReader};
use crate::transport::{CancelHandle, Cancellation, Transport};
use crate::writer::{
    ERROR_BLOCK_TAG, METRICSET_BLOCK_TAG, ModelWriter, SPAN_BLOCK_TAG, TRANSACTION_BLOCK_TAG,
};

/// 循环的输入通道。
pub(super) struct LoopChannels {
    pub(super) events: mpsc::Receiver<TracerEvent>,
    pub(super) config_commands: mpsc::UnboundedReceiver<ConfigCommand>,
    pub(super) force_flush: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    pub(super) force_send_metrics: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    pub(super) closing: watch::Receiver<bool>,
}

/// 构造期确定、运行期不变的参数。
pub(super) struct LoopParams {
    pub(super) service: ServiceInfo,
    pub(super) labels: BTreeMap<String, String>,
    pub(super) buffer_size: usize,
    pub(super) metrics_buffer_size: usize,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) stats: Arc<Mutex<TracerStats>>,
}

/// 远期截止时间的跨度，超出 `Instant` 表示范围的时长按它折算。
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// 运行事件循环直至关闭，随后标记追踪器为非激活并唤醒等待关闭的调用方。
pub(super) async fn run(
    channels: LoopChannels,
    params: LoopParams,
    active: Arc<AtomicBool>,
    closed: watch::Sender<bool>,
) {
    let _exit = LoopExit { active, closed };
    TracerLoop::new(channels, params).run().await;
}

/// 循环任务结束（含 panic 展开）时撤下激活标记并通知关闭。
struct LoopExit {
    active: Arc<AtomicBool>,
    closed: watch::Sender<bool>,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        self.closed.send_replace(true);
    }
}

/// `now + after`；溢出时退化为远期截止时间。
fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

enum LoopInput {
    Closing,
    Command(ConfigCommand),
    Event(TracerEvent),
    RequestTimer,
    MetricsTimer,
    SendMetrics(oneshot::Sender<()>),
    Gathered(Metrics),
    Flush(oneshot::Sender<()>),
    Read(ReadRequest),
    Sent(Result<(), TransportError>),
}

/// 等待“调用时刻已缓冲的块全部离开缓冲”的调用方。
struct FlushWaiter {
    trace_target: u64,
    metrics_target: u64,
    reply: oneshot::Sender<()>,
}

/// 等待强制指标发送的调用方；采集完成前目标未知。
struct MetricsWaiter {
    target: Option<u64>,
    reply: oneshot::Sender<()>,
}

struct TracerLoop {
    channels: LoopChannels,
    cfg: TracerConfig,
    service: ServiceInfo,
    labels: BTreeMap<String, String>,
    metadata: Option<Vec<u8>>,

    buffer: RingBuffer,
    metrics_buffer: RingBuffer,
    evictions: Arc<EvictionTally>,
    writer: ModelWriter,
    stats: TracerStats,
    shared_stats: Arc<Mutex<TracerStats>>,

    assembler: StreamAssembler,
    close_request: bool,
    flush_request: bool,
    grace: Option<Duration>,
    read_requests: Option<mpsc::UnboundedReceiver<ReadRequest>>,
    pending_read: Option<ReadRequest>,
    send_requests: mpsc::Sender<SendRequest>,
    results: mpsc::Receiver<Result<(), TransportError>>,
    cancel_handle: CancelHandle,
    cancel: Cancellation,

    request_timer: Pin<Box<Sleep>>,
    request_timer_active: bool,
    metrics_timer: Pin<Box<Sleep>>,
    metrics_timer_start: Option<Instant>,
    gathering: bool,
    gathered_tx: mpsc::Sender<Metrics>,
    gathered_rx: mpsc::Receiver<Metrics>,

    flush_waiters: Vec<FlushWaiter>,
    metrics_waiters: Vec<MetricsWaiter>,
}

fn eviction_hook(tally: Arc<EvictionTally>) -> spark_ringbuffer::EvictionHook {
    Box::new(move |header: BlockHeader| {
        let counter = match header.tag {
            TRANSACTION_BLOCK_TAG => &tally.transactions,
            SPAN_BLOCK_TAG => &tally.spans,
            ERROR_BLOCK_TAG => &tally.errors,
            METRICSET_BLOCK_TAG => &tally.metricsets,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    })
}

async fn recv_read(
    requests: &mut Option<mpsc::UnboundedReceiver<ReadRequest>>,
) -> Option<ReadRequest> {
    match requests {
        Some(requests) => requests.recv().await,
        None => std::future::pending().await,
    }
}

impl TracerLoop {
    fn new(channels: LoopChannels, params: LoopParams) -> Self {
        let evictions = Arc::new(EvictionTally::default());
        let buffer = RingBuffer::with_eviction_hook(
            params.buffer_size,
            eviction_hook(Arc::clone(&evictions)),
        );
        let metrics_buffer = RingBuffer::with_eviction_hook(
            params.metrics_buffer_size,
            eviction_hook(Arc::clone(&evictions)),
        );

        let (cancel_handle, cancel) = Cancellation::pair();
        let (send_requests, send_rx) = mpsc::channel(1);
        let (result_tx, results) = mpsc::channel(1);
        spawn_request_driver(params.transport, cancel.clone(), send_rx, result_tx);
        let (gathered_tx, gathered_rx) = mpsc::channel(1);

        Self {
            channels,
            cfg: TracerConfig::default(),
            service: params.service,
            labels: params.labels,
            metadata: None,
            buffer,
            metrics_buffer,
            evictions,
            writer: ModelWriter::default(),
            stats: TracerStats::default(),
            shared_stats: params.stats,
            assembler: StreamAssembler::new(),
            close_request: false,
            flush_request: false,
            grace: None,
            read_requests: None,
            pending_read: None,
            send_requests,
            results,
            cancel_handle,
            cancel,
            request_timer: Box::pin(tokio::time::sleep(Duration::ZERO)),
            request_timer_active: false,
            metrics_timer: Box::pin(tokio::time::sleep(Duration::ZERO)),
            metrics_timer_start: None,
            gathering: false,
            gathered_tx,
            gathered_rx,
            flush_waiters: Vec::new(),
            metrics_waiters: Vec::new(),
        }
    }

    async fn run(mut self) {
        loop {
            let mut gather = false;
            match self.next_input().await {
                LoopInput::Closing => {
                    self.shutdown();
                    return;
                }
                LoopInput::Command(command) => {
                    self.apply_command(command);
                    continue;
                }
                LoopInput::Event(event) => {
                    // 错误需要尽快送达，写入后立即同步刷新压缩流。
                    if matches!(event, TracerEvent::Error(_)) {
                        self.flush_request = true;
                    }
                    self.write_event(event);
                }
                LoopInput::RequestTimer => {
                    self.request_timer_active = false;
                    self.close_request = true;
                }
                LoopInput::MetricsTimer => {
                    self.metrics_timer_start = None;
                    gather = !self.gathering;
                }
                LoopInput::SendMetrics(reply) => {
                    self.metrics_timer_start = None;
                    self.metrics_waiters.push(MetricsWaiter {
                        target: None,
                        reply,
                    });
                    gather = !self.gathering;
                }
                LoopInput::Gathered(metrics) => self.on_gathered(metrics),
                LoopInput::Flush(reply) => {
                    self.drain_queued_events();
                    self.flush_waiters.push(FlushWaiter {
                        trace_target: self.buffer.inserted_total(),
                        metrics_target: self.metrics_buffer.inserted_total(),
                        reply,
                    });
                }
                LoopInput::Read(request) => self.pending_read = Some(request),
                LoopInput::Sent(result) => self.complete_request(result),
            }

            self.evictions.drain_into(&mut self.stats);
            self.publish_stats();

            if gather {
                self.start_gather();
            }

            self.settle_waiters();
            if !self.flush_waiters.is_empty() {
                self.close_request = true;
            }

            if !self.assembler.is_active() {
                if self.buffer.is_empty() && self.metrics_buffer.is_empty() {
                    continue;
                }
                self.open_request();
            }

            self.fill_request();
            self.finish_or_flush();
            self.respond_to_read();
        }
    }

    async fn next_input(&mut self) -> LoopInput {
        let request_timer_active = self.request_timer_active;
        let metrics_timer_active = self.metrics_timer_start.is_some();
        let accept_read = self.pending_read.is_none() && self.read_requests.is_some();
        let closing = &mut self.channels.closing;
        // 控制输入优先于事件：配置命令先于其后投递的事件生效。
        tokio::select! {
            biased;
            () = async {
                // 发送端被丢弃（所有句柄都已释放）同样视为关闭。
                let _ = closing.wait_for(|set| *set).await;
            } => LoopInput::Closing,
            Some(command) = self.channels.config_commands.recv() => LoopInput::Command(command),
            Some(result) = self.results.recv() => LoopInput::Sent(result),
            Some(request) = recv_read(&mut self.read_requests), if accept_read => LoopInput::Read(request),
            Some(metrics) = self.gathered_rx.recv() => LoopInput::Gathered(metrics),
            () = &mut self.request_timer, if request_timer_active => LoopInput::RequestTimer,
            () = &mut self.metrics_timer, if metrics_timer_active => LoopInput::MetricsTimer,
            Some(reply) = self.channels.force_send_metrics.recv() => LoopInput::SendMetrics(reply),
            Some(reply) = self.channels.force_flush.recv() => LoopInput::Flush(reply),
            Some(event) = self.channels.events.recv() => LoopInput::Event(event),
        }
    }

    fn log_debug(&self, message: impl FnOnce() -> String) {
        if let Some(logger) = &self.cfg.logger {
            logger.debug(&message());
        }
    }

    fn apply_command(&mut self, command: ConfigCommand) {
        let previous = self.cfg.metrics_interval;
        command(&mut self.cfg);
        let interval = self.cfg.metrics_interval;
        if self.gathering || interval == previous {
            return;
        }
        match self.metrics_timer_start {
            None => {
                if !interval.is_zero() {
                    self.arm_metrics_timer(interval);
                }
            }
            Some(_) if interval.is_zero() => self.metrics_timer_start = None,
            Some(start) => {
                // 周期变化时保留已经过去的时间。
                let remaining = interval.saturating_sub(start.elapsed());
                self.metrics_timer
                    .as_mut()
                    .reset(deadline_after(Instant::now(), remaining));
            }
        }
    }

    fn arm_metrics_timer(&mut self, after: Duration) {
        let now = Instant::now();
        self.metrics_timer_start = Some(now);
        self.metrics_timer.as_mut().reset(deadline_after(now, after));
    }

    fn write_event(&mut self, event: TracerEvent) {
        self.writer
            .write_event(event, &mut self.buffer, &self.cfg, &mut self.stats);
    }

    fn drain_queued_events(&mut self) {
        for _ in 0..self.channels.events.len() {
            match self.channels.events.try_recv() {
                Ok(event) => self.write_event(event),
                Err(_) => break,
            }
        }
    }

    fn on_gathered(&mut self, metrics: Metrics) {
        self.writer
            .write_metrics(metrics, &mut self.metrics_buffer, &mut self.stats);
        self.gathering = false;
        self.flush_request = true;
        let target = self.metrics_buffer.inserted_total();
        for waiter in &mut self.metrics_waiters {
            waiter.target.get_or_insert(target);
        }
        if !self.cfg.metrics_interval.is_zero() {
            self.arm_metrics_timer(self.cfg.metrics_interval);
        }
    }

    fn start_gather(&mut self) {
        self.gathering = true;
        let gatherers = self
            .cfg
            .metrics_gatherers
            .iter()
            .map(|(_, gatherer)| Arc::clone(gatherer))
            .collect();
        spawn_gather(
            gatherers,
            self.cfg.disabled_metrics.clone(),
            self.cancel.clone(),
            self.cfg.logger.clone(),
            self.gathered_tx.clone(),
        );
        self.log_debug(|| "gathering metrics".to_owned());
    }

    fn publish_stats(&mut self) {
        if self.stats.is_zero() {
            return;
        }
        self.shared_stats.lock().accumulate(&self.stats);
        self.stats = TracerStats::default();
    }

    /// 结算等待者：目标块已离开缓冲，且不在尚未完成的请求中。
    fn settle_waiters(&mut self) {
        let in_flight = self.assembler.counts();
        let trace_settled = self
            .buffer
            .removed_total()
            .saturating_sub(in_flight.trace_blocks());
        let metrics_settled = self
            .metrics_buffer
            .removed_total()
            .saturating_sub(in_flight.metricsets);

        let mut index = 0;
        while index < self.flush_waiters.len() {
            let waiter = &self.flush_waiters[index];
            if trace_settled >= waiter.trace_target && metrics_settled >= waiter.metrics_target {
                let waiter = self.flush_waiters.swap_remove(index);
                let _ = waiter.reply.send(());
            } else {
                index += 1;
            }
        }

        let mut index = 0;
        while index < self.metrics_waiters.len() {
            match self.metrics_waiters[index].target {
                Some(target) if metrics_settled >= target => {
                    let waiter = self.metrics_waiters.swap_remove(index);
                    let _ = waiter.reply.send(());
                }
                _ => index += 1,
            }
        }
    }

    fn open_request(&mut self) {
        if self.metadata.is_none() {
            let encoded = encode_metadata(&self.service, &self.labels).unwrap_or_else(|err| {
                self.log_debug(|| format!("encoding request metadata failed: {err}"));
                Vec::new()
            });
            self.metadata = Some(encoded);
        }
        let metadata = self.metadata.as_deref().unwrap_or_default();
        if let Err(err) = self.assembler.open(metadata) {
            let message = format!("starting request stream failed: {err}");
            self.log_debug(|| message);
        }

        let (reader, read_requests) = StreamReader::channel();
        self.read_requests = Some(read_requests);
        let request = SendRequest {
            grace: self.grace.unwrap_or_default(),
            reader,
        };
        if self.send_requests.try_send(request).is_err() {
            self.log_debug(|| "request driver is no longer running".to_owned());
        }

        let deadline = deadline_after(Instant::now(), self.cfg.request_duration);
        self.request_timer.as_mut().reset(deadline);
        self.request_timer_active = true;
    }

    fn fill_request(&mut self) {
        if self.assembler.is_closed() {
            return;
        }
        loop {
            if self.assembler.counts().total() > 0
                && self.assembler.written() >= self.cfg.request_size
            {
                break;
            }
            if !self.metrics_buffer.is_empty() {
                if self.assembler.write_block(&mut self.metrics_buffer).is_ok()
                    && self.metrics_waiters.iter().any(|waiter| waiter.target.is_some())
                {
                    // 有调用方在等待这批指标：尽快结束请求以便确认。
                    self.close_request = true;
                }
                continue;
            }
            if self.buffer.is_empty() {
                break;
            }
            let _ = self.assembler.write_block(&mut self.buffer);
        }
        if self.assembler.written() >= self.cfg.request_size {
            self.close_request = true;
        }
    }

    fn finish_or_flush(&mut self) {
        if self.close_request {
            if let Err(err) = self.assembler.close() {
                self.log_debug(|| format!("closing request stream failed: {err}"));
            }
        } else if self.flush_request && !self.assembler.is_flushed() {
            self.flush_request = false;
            if let Err(err) = self.assembler.flush() {
                self.log_debug(|| format!("flushing request stream failed: {err}"));
            }
        }
    }

    fn respond_to_read(&mut self) {
        let Some(request) = self.pending_read.take() else {
            return;
        };
        match self.assembler.take_chunk(request.max_len) {
            // 传输侧已放弃读取时应答无人接收，忽略即可。
            Some(chunk) => {
                let _ = request.reply.send(chunk);
            }
            None => self.pending_read = Some(request),
        }
    }

    fn complete_request(&mut self, result: Result<(), TransportError>) {
        match result {
            Err(err) => {
                self.stats.errors.send_stream += 1;
                let next = next_grace_period(self.grace, self.cfg.max_grace_period);
                self.grace = Some(next);
                if let Some(logger) = &self.cfg.logger {
                    let message = format!("request failed: {err} (next request in ~{next:?})");
                    if err.is_version_mismatch() {
                        logger.error(&message);
                    } else {
                        logger.debug(&message);
                    }
                }
            }
            Ok(()) => {
                self.grace = None;
                let counts = self.assembler.counts();
                self.stats.transactions_sent += counts.transactions;
                self.stats.spans_sent += counts.spans;
                self.stats.errors_sent += counts.errors;
                self.stats.metricsets_sent += counts.metricsets;
                self.log_debug(|| {
                    format!(
                        "sent request with {} transaction{}, {} span{}, {} error{}, {} metricset{}",
                        counts.transactions,
                        plural(counts.transactions),
                        counts.spans,
                        plural(counts.spans),
                        counts.errors,
                        plural(counts.errors),
                        counts.metricsets,
                        plural(counts.metricsets),
                    )
                });
            }
        }

        // 丢弃未决读请求与请求通道，读取端随之观察到 EOF。
        self.pending_read = None;
        self.read_requests = None;
        self.close_request = false;
        self.flush_request = false;
        self.request_timer_active = false;
        self.assembler.reset();
    }

    fn shutdown(&mut self) {
        self.cancel_handle.cancel();
        if let Some(request) = self.pending_read.take() {
            let _ = request.reply.send(ReadChunk {
                data: Bytes::new(),
                eof: true,
            });
        }
        self.read_requests = None;
        self.publish_stats();
    }
}

fn plural(count: u64) -> &'static str {
    if count == 1 { "" } else { "s" }
}
