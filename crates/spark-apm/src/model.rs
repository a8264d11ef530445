//! 已完成记录的数据模型。
//!
//! # 教案式说明
//! - **意图（Why）**：插桩调用点只负责把“已结束”的事务、Span、错误投递进事件通道，
//!   事件循环接管所有权后一次性编码为块，随即丢弃；
//! - **契约（What）**：模型只描述编码所需的字段，线协议细节由 `serde` 派生决定，
//!   时间戳统一为 Unix 纪元微秒，时长以毫秒浮点输出。

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};

/// 16 字节追踪标识，序列化为小写十六进制。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TraceId(pub [u8; 16]);

/// 8 字节 Span/事务/错误标识，序列化为小写十六进制。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SpanId(pub [u8; 8]);

macro_rules! hex_id {
    ($ty:ty) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }
    };
}

hex_id!(TraceId);
hex_id!(SpanId);

/// 当前时刻的 Unix 纪元微秒。
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or_default()
}

fn duration_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1_000.0)
}

/// 栈帧；`pre_context`/`context_line`/`post_context` 由 [`crate::ContextSetter`] 按需填充。
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StackFrame {
    #[serde(rename = "filename")]
    pub file: String,
    #[serde(rename = "lineno")]
    pub line: u32,
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pre_context: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_line: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_context: Vec<String>,
}

/// 事务携带的 HTTP 请求上下文，编码前会按脱敏规则改写。
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub form: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TransactionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestContext>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SpanCount {
    pub started: u32,
    pub dropped: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Transaction {
    pub id: SpanId,
    pub trace_id: TraceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub timestamp: u64,
    #[serde(serialize_with = "duration_millis")]
    pub duration: Duration,
    pub sampled: bool,
    pub span_count: SpanCount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<TransactionContext>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Span {
    pub id: SpanId,
    pub transaction_id: SpanId,
    pub trace_id: TraceId,
    pub parent_id: SpanId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: u64,
    #[serde(serialize_with = "duration_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<StackFrame>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Exception {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<StackFrame>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ErrorLog {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<StackFrame>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<SpanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub culprit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<Exception>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<ErrorLog>,
}

impl ErrorRecord {
    pub(crate) fn frames_mut(&mut self) -> impl Iterator<Item = &mut StackFrame> {
        let exception = self
            .exception
            .iter_mut()
            .flat_map(|exception| exception.stacktrace.iter_mut());
        let log = self.log.iter_mut().flat_map(|log| log.stacktrace.iter_mut());
        exception.chain(log)
    }
}

/// 投递进事件通道的记录。所有权随投递转移给事件循环。
#[derive(Debug)]
pub enum TracerEvent {
    Transaction(Box<Transaction>),
    Span(Box<Span>),
    Error(Box<ErrorRecord>),
}

impl From<Transaction> for TracerEvent {
    fn from(value: Transaction) -> Self {
        TracerEvent::Transaction(Box::new(value))
    }
}

impl From<Span> for TracerEvent {
    fn from(value: Span) -> Self {
        TracerEvent::Span(Box::new(value))
    }
}

impl From<ErrorRecord> for TracerEvent {
    fn from(value: ErrorRecord) -> Self {
        TracerEvent::Error(Box::new(value))
    }
}
