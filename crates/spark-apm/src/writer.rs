//! 模型写入器：把记录编码为带标签的块并写入环形缓冲。
//!
//! # 教案式说明
//! - **意图（Why）**：编码发生在事件循环内、记录所有权转移之后，插桩调用点因此无需承担序列化开销；
//! - **逻辑（How）**：事务先按脱敏规则改写请求上下文，Span/错误的栈帧按需补全源码上下文，
//!   随后以 `{"<kind>":{...}}` 信封编码为一行 JSON，写入对应缓冲；
//! - **契约（What）**：编码失败不向外报告，只计入对应类别的丢弃数；
//!   块负载不含换行，换行由流组装器在写出时追加。

use serde::Serialize;
use spark_ringbuffer::{BlockTag, RingBuffer};

use crate::config::TracerConfig;
use crate::metrics::{Metrics, Metricset};
use crate::model::{ErrorRecord, RequestContext, Span, StackFrame, Transaction, TracerEvent};
use crate::stats::TracerStats;
use crate::wildcard::Matchers;

pub(crate) const TRANSACTION_BLOCK_TAG: BlockTag = BlockTag(1);
pub(crate) const SPAN_BLOCK_TAG: BlockTag = BlockTag(2);
pub(crate) const ERROR_BLOCK_TAG: BlockTag = BlockTag(3);
pub(crate) const METRICSET_BLOCK_TAG: BlockTag = BlockTag(4);

/// 脱敏后的替换值。
pub const REDACTED: &str = "[REDACTED]";

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Envelope<'a> {
    Transaction(&'a Transaction),
    Span(&'a Span),
    Error(&'a ErrorRecord),
    Metricset(&'a Metricset),
}

/// 可复用编码缓冲的写入器，由事件循环独占。
#[derive(Debug, Default)]
pub(crate) struct ModelWriter {
    scratch: Vec<u8>,
}

impl ModelWriter {
    /// 编码一条追踪事件并写入追踪缓冲；编码失败只计入丢弃数。
    pub(crate) fn write_event(
        &mut self,
        event: TracerEvent,
        buffer: &mut RingBuffer,
        cfg: &TracerConfig,
        stats: &mut TracerStats,
    ) {
        match event {
            TracerEvent::Transaction(mut tx) => {
                stats.transactions_accepted += 1;
                sanitize_transaction(&mut tx, &cfg.sanitized_field_names);
                if !self.encode(buffer, TRANSACTION_BLOCK_TAG, &Envelope::Transaction(&tx)) {
                    stats.transactions_dropped += 1;
                }
            }
            TracerEvent::Span(mut span) => {
                stats.spans_accepted += 1;
                set_frames_context(span.stacktrace.iter_mut(), cfg);
                if !self.encode(buffer, SPAN_BLOCK_TAG, &Envelope::Span(&span)) {
                    stats.spans_dropped += 1;
                }
            }
            TracerEvent::Error(mut error) => {
                stats.errors_accepted += 1;
                set_frames_context(error.frames_mut(), cfg);
                if !self.encode(buffer, ERROR_BLOCK_TAG, &Envelope::Error(&error)) {
                    stats.errors_dropped += 1;
                }
            }
        }
    }

    /// 每个 metricset 编码为一块写入指标缓冲。
    pub(crate) fn write_metrics(
        &mut self,
        metrics: Metrics,
        buffer: &mut RingBuffer,
        stats: &mut TracerStats,
    ) {
        for set in metrics.into_metricsets() {
            if !self.encode(buffer, METRICSET_BLOCK_TAG, &Envelope::Metricset(&set)) {
                stats.metricsets_dropped += 1;
            }
        }
    }

    fn encode(
        &mut self,
        buffer: &mut RingBuffer,
        tag: BlockTag,
        envelope: &Envelope<'_>,
    ) -> bool {
        self.scratch.clear();
        if serde_json::to_writer(&mut self.scratch, envelope).is_err() {
            return false;
        }
        buffer.insert(tag, &self.scratch);
        true
    }
}

fn sanitize_transaction(tx: &mut Transaction, matchers: &Matchers) {
    if matchers.is_empty() {
        return;
    }
    if let Some(request) = tx.context.as_mut().and_then(|ctx| ctx.request.as_mut()) {
        sanitize_request(request, matchers);
    }
}

fn sanitize_request(request: &mut RequestContext, matchers: &Matchers) {
    let mut cookie_redacted = false;
    for (name, value) in request.cookies.iter_mut() {
        if matchers.matches_any(name) {
            *value = REDACTED.to_owned();
            cookie_redacted = true;
        }
    }
    for (name, value) in request.form.iter_mut() {
        if matchers.matches_any(name) {
            *value = REDACTED.to_owned();
        }
    }
    for (name, value) in request.headers.iter_mut() {
        let is_cookie = name.eq_ignore_ascii_case("cookie");
        if (is_cookie && cookie_redacted) || matchers.matches_any(name) {
            *value = REDACTED.to_owned();
        }
    }
}

fn set_frames_context<'a>(frames: impl Iterator<Item = &'a mut StackFrame>, cfg: &TracerConfig) {
    let Some(setter) = cfg.context_setter.as_ref() else {
        return;
    };
    for frame in frames {
        // 单帧失败只意味着该帧没有源码上下文。
        let _ = setter.set_context(frame, cfg.pre_context, cfg.post_context);
    }
}
