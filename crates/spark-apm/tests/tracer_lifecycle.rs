//! 追踪器端到端行为：统计、刷新、关闭、重试与指标。

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use spark_apm::{
    Cancellation, ErrorRecord, FlushOutcome, GatherError, IngestError, Logger, Metrics,
    MetricsGatherer, Span, StreamReader, Tracer, TracerOptions, Transaction, Transport, TransportError,
};
use spark_ringbuffer::BLOCK_HEADER_LEN;
use tokio::io::AsyncReadExt;
use tokio::sync::{Notify, watch};

const WAIT: Duration = Duration::from_secs(10);

fn options(name: &str) -> TracerOptions {
    TracerOptions {
        service_name: name.into(),
        metrics_interval: Duration::ZERO,
        ..TracerOptions::default()
    }
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("操作应在超时前完成")
}

async fn flush(tracer: &Tracer) -> FlushOutcome {
    within(tracer.flush(std::future::pending())).await
}

/// 读完整条流；`gate` 为假时先阻塞，并记录并发峰值。
struct Gated {
    gate: watch::Receiver<bool>,
    started: Notify,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Gated {
    fn new() -> (Arc<Self>, watch::Sender<bool>) {
        let (open, gate) = watch::channel(false);
        let transport = Arc::new(Self {
            gate,
            started: Notify::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        (transport, open)
    }
}

#[async_trait]
impl Transport for Gated {
    async fn send_stream(
        &self,
        _cancel: Cancellation,
        mut stream: StreamReader,
    ) -> Result<(), TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        let mut body = Vec::new();
        let read = stream.read_to_end(&mut body).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        read?;
        Ok(())
    }
}

#[derive(Serialize)]
struct TransactionLine<'a> {
    transaction: &'a Transaction,
}

#[derive(Serialize)]
struct ErrorLine<'a> {
    error: &'a ErrorRecord,
}

#[tokio::test(flavor = "multi_thread")]
async fn evicted_records_are_reported_as_dropped() {
    let tx = Transaction::default();
    let err = ErrorRecord::default();
    let tx_block = serde_json::to_vec(&TransactionLine { transaction: &tx })
        .expect("事务可编码")
        .len()
        + BLOCK_HEADER_LEN;
    let err_block = serde_json::to_vec(&ErrorLine { error: &err })
        .expect("错误可编码")
        .len()
        + BLOCK_HEADER_LEN;

    // 容纳 3 个事务加 1 个错误，但不足以再放下第二个错误。
    let (transport, open) = Gated::new();
    let tracer = Tracer::new(
        TracerOptions {
            buffer_size: 3 * tx_block + 2 * err_block - 1,
            request_size: 1,
            ..options("eviction")
        },
        transport.clone(),
    )
    .expect("构造追踪器");

    // 首个请求只携带一个 Span 并被阻塞，之后的记录全部留在缓冲中。
    tracer.submit_async(Span::default()).await.expect("投递 Span");
    within(transport.started.notified()).await;

    for _ in 0..3 {
        tracer.submit_async(tx.clone()).await.expect("投递事务");
    }
    for _ in 0..2 {
        tracer.submit_async(err.clone()).await.expect("投递错误");
    }
    within(async {
        loop {
            let stats = tracer.stats();
            if stats.transactions_accepted == 3 && stats.errors_accepted == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(tracer.stats().transactions_dropped, 1, "最旧的事务应被淘汰");

    tracer.set_request_size(1024 * 1024);
    open.send_replace(true);
    assert_eq!(flush(&tracer).await, FlushOutcome::Completed);

    let stats = tracer.stats();
    assert_eq!(stats.transactions_dropped, 1);
    assert_eq!(stats.transactions_sent, 2);
    assert_eq!(stats.errors_sent, 2);
    assert_eq!(stats.errors_dropped, 0);
    assert_eq!(stats.spans_sent, 1);
    assert_eq!(transport.peak.load(Ordering::SeqCst), 1, "任意时刻至多一个请求在途");
    tracer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_reports_abort_before_acknowledgement() {
    let (transport, _open) = Gated::new();
    let tracer = Tracer::new(options("abort"), transport.clone()).expect("构造追踪器");
    tracer
        .submit_async(Transaction::default())
        .await
        .expect("投递事务");
    within(transport.started.notified()).await;

    let outcome = within(tracer.flush(async {})).await;
    assert_eq!(outcome, FlushOutcome::Aborted);
    tracer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_ends_the_in_flight_stream_gracefully() {
    struct Observer {
        started: Notify,
        outcome: Mutex<Option<(bool, bool)>>,
    }

    #[async_trait]
    impl Transport for Observer {
        async fn send_stream(
            &self,
            cancel: Cancellation,
            mut stream: StreamReader,
        ) -> Result<(), TransportError> {
            self.started.notify_one();
            let mut body = Vec::new();
            let clean_eof = stream.read_to_end(&mut body).await.is_ok();
            *self.outcome.lock() = Some((clean_eof, cancel.is_cancelled()));
            Ok(())
        }
    }

    let transport = Arc::new(Observer {
        started: Notify::new(),
        outcome: Mutex::new(None),
    });
    let tracer = Tracer::new(
        TracerOptions {
            request_duration: Duration::from_secs(3600),
            ..options("close")
        },
        transport.clone(),
    )
    .expect("构造追踪器");
    tracer
        .submit_async(Transaction::default())
        .await
        .expect("投递事务");
    within(transport.started.notified()).await;

    within(tracer.close()).await;
    assert!(!tracer.active());

    within(async {
        while transport.outcome.lock().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(
        *transport.outcome.lock(),
        Some((true, true)),
        "传输侧应观察到取消信号与干净的流结束"
    );

    assert_eq!(flush(&tracer).await, FlushOutcome::Closed);
    assert!(matches!(
        tracer.submit(Transaction::default()),
        Err(IngestError::Closed(_))
    ));
    // 重复关闭立即返回。
    within(tracer.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn small_requests_never_overlap() {
    let (transport, open) = Gated::new();
    open.send_replace(true);
    let tracer = Tracer::new(
        TracerOptions {
            request_size: 64,
            ..options("serial")
        },
        transport.clone(),
    )
    .expect("构造追踪器");
    for _ in 0..50 {
        tracer
            .submit_async(Transaction::default())
            .await
            .expect("投递事务");
    }
    assert_eq!(flush(&tracer).await, FlushOutcome::Completed);
    assert_eq!(tracer.stats().transactions_sent, 50);
    assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    tracer.close().await;
}

/// 前 `failures` 次发送失败，之后读完整条流并成功。
struct Flaky {
    failures: usize,
    attempts: AtomicUsize,
    mismatch: bool,
}

#[async_trait]
impl Transport for Flaky {
    async fn send_stream(
        &self,
        _cancel: Cancellation,
        mut stream: StreamReader,
    ) -> Result<(), TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await?;
        if attempt < self.failures {
            return Err(if self.mismatch {
                TransportError::VersionMismatch {
                    status: 404,
                    message: "unknown intake endpoint".into(),
                }
            } else {
                TransportError::Rejected {
                    status: 503,
                    message: "collector unavailable".into(),
                }
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingLogger {
    debug: Mutex<Vec<String>>,
    error: Mutex<Vec<String>>,
}

impl Logger for RecordingLogger {
    fn debug(&self, message: &str) {
        self.debug.lock().push(message.to_owned());
    }

    fn error(&self, message: &str) {
        self.error.lock().push(message.to_owned());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_request_is_counted_and_the_next_one_succeeds() {
    let transport = Arc::new(Flaky {
        failures: 1,
        attempts: AtomicUsize::new(0),
        mismatch: false,
    });
    let logger = Arc::new(RecordingLogger::default());
    let tracer = Tracer::new(options("retry"), transport.clone()).expect("构造追踪器");
    tracer.set_logger(Some(logger.clone()));

    tracer
        .submit_async(Transaction::default())
        .await
        .expect("投递事务");
    assert_eq!(flush(&tracer).await, FlushOutcome::Completed);
    let stats = tracer.stats();
    assert_eq!(stats.errors.send_stream, 1);
    assert_eq!(stats.transactions_sent, 0, "失败请求中的记录不计入已发送");

    tracer
        .submit_async(Transaction::default())
        .await
        .expect("投递事务");
    assert_eq!(flush(&tracer).await, FlushOutcome::Completed);
    let stats = tracer.stats();
    assert_eq!(stats.errors.send_stream, 1);
    assert_eq!(stats.transactions_sent, 1);

    assert!(logger.error.lock().is_empty(), "普通失败只记录 debug 日志");
    assert!(
        logger
            .debug
            .lock()
            .iter()
            .any(|line| line.starts_with("request failed:"))
    );
    tracer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn version_mismatch_is_logged_as_error() {
    let transport = Arc::new(Flaky {
        failures: 1,
        attempts: AtomicUsize::new(0),
        mismatch: true,
    });
    let logger = Arc::new(RecordingLogger::default());
    let tracer = Tracer::new(options("mismatch"), transport).expect("构造追踪器");
    tracer.set_logger(Some(logger.clone()));

    tracer
        .submit_async(ErrorRecord::default())
        .await
        .expect("投递错误");
    assert_eq!(flush(&tracer).await, FlushOutcome::Completed);
    let errors = logger.error.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("next request in"), "日志应提示下一次请求的时间: {errors:?}");
    tracer.close().await;
}

struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl MetricsGatherer for Counting {
    async fn gather(
        &self,
        _cancel: &Cancellation,
        metrics: &mut Metrics,
    ) -> Result<(), GatherError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        metrics.add("jobs.queued", &[("queue", "default")], 12.0);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn send_metrics_gathers_and_deregistration_sticks() {
    let tracer = Tracer::new(options("metrics"), Arc::new(spark_apm::DiscardTransport))
        .expect("构造追踪器");
    let gatherer = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    let registration = tracer.register_metrics_gatherer(gatherer.clone());

    let outcome = within(tracer.send_metrics(std::future::pending())).await;
    assert_eq!(outcome, FlushOutcome::Completed);
    assert_eq!(gatherer.calls.load(Ordering::SeqCst), 1);
    let sent = tracer.stats().metricsets_sent;
    assert!(sent >= 2, "内置采集器与自定义采集器各贡献至少一个 metricset");

    registration.deregister();
    registration.deregister();
    let outcome = within(tracer.send_metrics(std::future::pending())).await;
    assert_eq!(outcome, FlushOutcome::Completed);
    assert_eq!(gatherer.calls.load(Ordering::SeqCst), 1, "注销后不再被调用");
    tracer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn span_limit_follows_configuration() {
    let tracer = Tracer::new(
        TracerOptions {
            max_spans: 0,
            ..options("spans")
        },
        Arc::new(spark_apm::DiscardTransport),
    )
    .expect("构造追踪器");
    assert!(tracer.span_allowed(1_000_000), "0 表示不限制");
    tracer.set_max_spans(-1);
    assert!(tracer.span_allowed(1_000_000), "负值表示不限制");
    tracer.set_max_spans(3);
    assert!(tracer.span_allowed(2));
    assert!(!tracer.span_allowed(3));
    tracer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unbounded_request_duration_keeps_the_loop_alive() {
    let (transport, open) = Gated::new();
    open.send_replace(true);
    let tracer = Tracer::new(options("long-request"), transport).expect("构造追踪器");
    tracer.set_request_duration(Duration::MAX);
    tracer
        .submit_async(Transaction::default())
        .await
        .expect("投递事务");

    assert_eq!(flush(&tracer).await, FlushOutcome::Completed);
    assert!(tracer.active(), "超长请求时长不应终止事件循环");
    assert_eq!(tracer.stats().transactions_sent, 1);

    within(tracer.close()).await;
    assert!(!tracer.active());
}

#[tokio::test(flavor = "multi_thread")]
async fn unbounded_metrics_interval_from_toml_keeps_the_loop_alive() {
    let opts = TracerOptions::from_toml_str(
        r#"
        service_name = "long-interval"
        metrics_interval = 9223372036854775807
        max_grace_period = 9223372036854775807
        "#,
    )
    .expect("合法 TOML");
    let tracer = Tracer::new(opts, Arc::new(spark_apm::DiscardTransport)).expect("构造追踪器");

    tracer
        .submit_async(Transaction::default())
        .await
        .expect("投递事务");
    assert_eq!(flush(&tracer).await, FlushOutcome::Completed);
    assert!(tracer.active(), "超长指标周期不应终止事件循环");

    // 计时器运行中再次修改周期，走保留已过时间的重排路径。
    tracer.set_metrics_interval(Duration::MAX);
    tracer.set_metrics_interval(Duration::from_secs(u64::MAX));
    let outcome = within(tracer.send_metrics(std::future::pending())).await;
    assert_eq!(outcome, FlushOutcome::Completed);
    assert!(tracer.active());
    assert!(tracer.stats().metricsets_sent >= 1);

    within(tracer.close()).await;
    assert!(!tracer.active());
}
