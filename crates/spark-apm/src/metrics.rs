//! 指标快照与采集协调。
//!
//! # 教案式说明
//! - **意图（Why）**：指标来自多个互不知情的采集器插件，采集可能涉及系统调用或锁，
//!   不能在事件循环内串行执行；
//! - **逻辑（How）**：[`spawn_gather`] 为每个采集器派生独立任务，并给每个任务一份隔离的
//!   [`Metrics`]，全部结束后按注册顺序合并，统一盖上同一个采集时间戳，再向循环发送且仅发送一次；
//! - **契约（What）**：单个采集器失败或 panic 只记录日志，其他采集器的结果照常上报；
//!   循环保证同一时刻至多一个采集周期在途。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::GatherError;
use crate::logging::Logger;
use crate::model::now_micros;
use crate::stats::TracerStats;
use crate::transport::Cancellation;
use crate::wildcard::Matchers;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub value: f64,
}

/// 共享同一标签集合的一组样本。
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Metricset {
    pub timestamp: u64,
    #[serde(rename = "tags", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub samples: BTreeMap<String, Sample>,
}

/// 一次采集周期的指标快照。
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    disabled: Matchers,
    metricsets: Vec<Metricset>,
}

impl Metrics {
    pub fn new(disabled: Matchers) -> Self {
        Self {
            disabled,
            metricsets: Vec::new(),
        }
    }

    /// 添加一个样本；名称命中禁用名单时静默丢弃。相同标签集合的样本归入同一个 [`Metricset`]。
    pub fn add(&mut self, name: &str, labels: &[(&str, &str)], value: f64) {
        if self.disabled.matches_any(name) {
            return;
        }
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        let index = match self.metricsets.iter().position(|set| set.labels == labels) {
            Some(index) => index,
            None => {
                self.metricsets.push(Metricset {
                    labels,
                    ..Metricset::default()
                });
                self.metricsets.len() - 1
            }
        };
        self.metricsets[index]
            .samples
            .insert(name.to_owned(), Sample { value });
    }

    pub fn metricsets(&self) -> &[Metricset] {
        &self.metricsets
    }

    pub fn is_empty(&self) -> bool {
        self.metricsets.is_empty()
    }

    pub(crate) fn into_metricsets(self) -> Vec<Metricset> {
        self.metricsets
    }

    fn merge(&mut self, other: Metrics) {
        for set in other.metricsets {
            match self
                .metricsets
                .iter_mut()
                .find(|existing| existing.labels == set.labels)
            {
                Some(existing) => existing.samples.extend(set.samples),
                None => self.metricsets.push(set),
            }
        }
    }

    fn stamp(&mut self, timestamp: u64) {
        for set in &mut self.metricsets {
            set.timestamp = timestamp;
        }
    }
}

/// 指标采集器插件。
///
/// 实现可能与其他采集器并发执行，不得假设调用顺序；取消信号在追踪器关闭时触发。
#[async_trait]
pub trait MetricsGatherer: Send + Sync + 'static {
    async fn gather(&self, cancel: &Cancellation, metrics: &mut Metrics)
    -> Result<(), GatherError>;
}

/// 派生一个采集周期，完成后向 `done` 发送合并结果。
pub(crate) fn spawn_gather(
    gatherers: Vec<Arc<dyn MetricsGatherer>>,
    disabled: Matchers,
    cancel: Cancellation,
    logger: Option<Arc<dyn Logger>>,
    done: mpsc::Sender<Metrics>,
) -> JoinHandle<()> {
    let timestamp = now_micros();
    tokio::spawn(async move {
        let mut tasks = JoinSet::new();
        for (order, gatherer) in gatherers.into_iter().enumerate() {
            let cancel = cancel.clone();
            let mut metrics = Metrics::new(disabled.clone());
            tasks.spawn(async move {
                let result = gatherer.gather(&cancel, &mut metrics).await;
                (order, result.map(|()| metrics))
            });
        }

        let mut collected = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((order, Ok(metrics))) => collected.push((order, metrics)),
                Ok((_, Err(err))) => {
                    if let Some(logger) = &logger {
                        logger.debug(&format!("gathering metrics failed: {err}"));
                    }
                }
                Err(err) => {
                    if let Some(logger) = &logger {
                        logger.error(&format!("metrics gatherer aborted: {err}"));
                    }
                }
            }
        }
        collected.sort_by_key(|(order, _)| *order);

        let mut merged = Metrics::new(disabled);
        for (_, metrics) in collected {
            merged.merge(metrics);
        }
        merged.stamp(timestamp);
        // 循环已退出时接收端被丢弃，结果随之作废。
        let _ = done.send(merged).await;
    })
}

/// 上报追踪器自身累计统计的内置采集器。
pub(crate) struct BuiltinMetricsGatherer {
    stats: Arc<Mutex<TracerStats>>,
}

impl BuiltinMetricsGatherer {
    pub(crate) fn new(stats: Arc<Mutex<TracerStats>>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl MetricsGatherer for BuiltinMetricsGatherer {
    async fn gather(
        &self,
        _cancel: &Cancellation,
        metrics: &mut Metrics,
    ) -> Result<(), GatherError> {
        let stats = *self.stats.lock();
        let samples = [
            ("agent.transactions.sent", stats.transactions_sent),
            ("agent.transactions.dropped", stats.transactions_dropped),
            ("agent.spans.sent", stats.spans_sent),
            ("agent.spans.dropped", stats.spans_dropped),
            ("agent.errors.sent", stats.errors_sent),
            ("agent.errors.dropped", stats.errors_dropped),
            ("agent.send_errors", stats.errors.send_stream),
        ];
        for (name, value) in samples {
            metrics.add(name, &[], value as f64);
        }
        Ok(())
    }
}
