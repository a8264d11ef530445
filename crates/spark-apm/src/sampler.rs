//! 采样决策能力。
//!
//! 采样算法本身不属于代理核心；此处只定义插桩调用点在热路径上读取的契约。

use crate::model::TraceId;

/// 根据追踪标识决定事务是否采样。
///
/// 实现需线程安全且足够廉价：每个新事务都会在调用方任务中同步调用一次。
pub trait Sampler: Send + Sync + 'static {
    fn sample(&self, trace_id: TraceId) -> bool;
}

impl<F> Sampler for F
where
    F: Fn(TraceId) -> bool + Send + Sync + 'static,
{
    fn sample(&self, trace_id: TraceId) -> bool {
        self(trace_id)
    }
}
