//! 累计统计。
//!
//! 事件循环在本地累积一轮迭代内的增量，迭代末尾非零时一次性并入共享快照；
//! 外部读取的是最近一次并入后的值，追踪器关闭后依然有效。

use std::sync::atomic::{AtomicU64, Ordering};

/// 发送失败相关计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TracerStatsErrors {
    /// 请求流发送失败次数。
    pub send_stream: u64,
}

/// 追踪器累计统计。所有计数单调递增。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TracerStats {
    pub errors: TracerStatsErrors,
    pub transactions_accepted: u64,
    pub transactions_sent: u64,
    pub transactions_dropped: u64,
    pub spans_accepted: u64,
    pub spans_sent: u64,
    pub spans_dropped: u64,
    pub errors_accepted: u64,
    pub errors_sent: u64,
    pub errors_dropped: u64,
    pub metricsets_sent: u64,
    pub metricsets_dropped: u64,
}

impl TracerStats {
    pub fn is_zero(&self) -> bool {
        *self == TracerStats::default()
    }

    pub fn accumulate(&mut self, other: &TracerStats) {
        self.errors.send_stream += other.errors.send_stream;
        self.transactions_accepted += other.transactions_accepted;
        self.transactions_sent += other.transactions_sent;
        self.transactions_dropped += other.transactions_dropped;
        self.spans_accepted += other.spans_accepted;
        self.spans_sent += other.spans_sent;
        self.spans_dropped += other.spans_dropped;
        self.errors_accepted += other.errors_accepted;
        self.errors_sent += other.errors_sent;
        self.errors_dropped += other.errors_dropped;
        self.metricsets_sent += other.metricsets_sent;
        self.metricsets_dropped += other.metricsets_dropped;
    }
}

/// 环形缓冲淘汰钩子写入的计数。
///
/// 钩子在构造缓冲时注入，与循环本地统计相互独立；循环每轮迭代调用 [`EvictionTally::drain_into`]
/// 把增量搬运到本地统计。
#[derive(Debug, Default)]
pub(crate) struct EvictionTally {
    pub(crate) transactions: AtomicU64,
    pub(crate) spans: AtomicU64,
    pub(crate) errors: AtomicU64,
    pub(crate) metricsets: AtomicU64,
}

impl EvictionTally {
    pub(crate) fn drain_into(&self, stats: &mut TracerStats) {
        stats.transactions_dropped += self.transactions.swap(0, Ordering::Relaxed);
        stats.spans_dropped += self.spans.swap(0, Ordering::Relaxed);
        stats.errors_dropped += self.errors.swap(0, Ordering::Relaxed);
        stats.metricsets_dropped += self.metricsets.swap(0, Ordering::Relaxed);
    }
}
