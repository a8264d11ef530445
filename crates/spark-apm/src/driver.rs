//! 请求驱动任务。
//!
//! # 教案式说明
//! - **意图（Why）**：网络发送可能长时间阻塞，事件循环绝不能等待它；
//!   驱动任务独占发送职责，循环只通过通道与之交互；
//! - **逻辑（How）**：
//!   1. 循环每打开一个请求就投递一个 [`SendRequest`]（容量为 1 的通道），携带当前宽限期；
//!   2. 驱动任务先按宽限期休眠（施加 ±10% 随机抖动），休眠与取消信号竞速；
//!   3. 随后在独立任务中调用 [`Transport::send_stream`]，传输实现 panic 会被映射为
//!      [`TransportError::Aborted`]，结果回送给循环；
//! - **契约（What）**：驱动任务串行处理请求，因此任意时刻至多一次发送在途；
//!   宽限期的推进规则见 [`next_grace_period`]。

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::stream::StreamReader;
use crate::transport::{Cancellation, Transport};

/// 宽限期抖动幅度（±10%）。
pub const GRACE_PERIOD_JITTER: f64 = 0.1;

const FIRST_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// 循环交给驱动任务的一次发送。
pub(crate) struct SendRequest {
    pub(crate) grace: Duration,
    pub(crate) reader: StreamReader,
}

/// 根据当前宽限期计算下一次失败后的宽限期。
///
/// `None` 表示链路健康（上一次发送成功或尚未发送），首次失败后的下一次发送不等待；
/// 之后依次为 1s、2s、4s……，以 `max` 封顶。
pub fn next_grace_period(current: Option<Duration>, max: Duration) -> Duration {
    match current {
        None => Duration::ZERO,
        Some(period) if period.is_zero() => FIRST_GRACE_PERIOD.min(max),
        Some(period) => period.saturating_mul(2).min(max),
    }
}

/// 对时长施加 `±jitter` 比例的均匀随机抖动；结果超出 `Duration` 范围时取 `Duration::MAX`。
pub fn jitter_duration<R: Rng + ?Sized>(base: Duration, jitter: f64, rng: &mut R) -> Duration {
    if base.is_zero() || jitter <= 0.0 {
        return base;
    }
    let factor = (1.0 + rng.gen_range(-jitter..=jitter)).max(0.0);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// 启动请求驱动任务。
pub(crate) fn spawn_request_driver(
    transport: Arc<dyn Transport>,
    cancel: Cancellation,
    mut requests: mpsc::Receiver<SendRequest>,
    results: mpsc::Sender<Result<(), TransportError>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        while let Some(request) = requests.recv().await {
            if !request.grace.is_zero() {
                let delay = jitter_duration(request.grace, GRACE_PERIOD_JITTER, &mut rng);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return,
                }
            }

            let send = tokio::spawn({
                let transport = Arc::clone(&transport);
                let cancel = cancel.clone();
                async move { transport.send_stream(cancel, request.reader).await }
            });
            let result = match send.await {
                Ok(result) => result,
                Err(err) => Err(TransportError::Aborted(err.to_string())),
            };
            if results.send(result).await.is_err() {
                return;
            }
        }
    })
}
