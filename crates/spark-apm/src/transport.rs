//! 传输能力与取消信号。
//!
//! # 教案式说明
//! - **意图（Why）**：网络细节（HTTP、TCP、TLS）不属于代理核心，核心只需要
//!   “把一条字节流送出去，返回成功或失败”；
//! - **逻辑（How）**：[`Transport::send_stream`] 接收一个按需拉取的 [`StreamReader`]，
//!   读到流结束即视为正常完成；[`Cancellation`] 在追踪器关闭时触发，
//!   告知实现“流即将以 EOF 收尾”，而非连接被粗暴中断；
//! - **契约（What）**：实现必须区分“疑似版本不匹配”的拒绝与其他失败，
//!   该区分只影响日志级别，不影响重试节奏。

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::TransportError;
use crate::stream::StreamReader;

/// 追踪器关闭时触发的取消信号。可廉价克隆，所有克隆观察同一信号。
#[derive(Clone, Debug)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

/// [`Cancellation`] 的触发端。
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Cancellation {
    /// 创建一对触发端与信号。
    pub fn pair() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancellation { rx })
    }

    /// 永不触发的信号。
    pub fn never() -> Self {
        let (_, cancellation) = Self::pair();
        cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// 等待信号触发；触发端在未触发的情况下被丢弃时永久挂起。
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// 流式传输能力。
///
/// 同一时刻至多有一次 `send_stream` 在途，由请求驱动任务保证。
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_stream(
        &self,
        cancel: Cancellation,
        stream: StreamReader,
    ) -> Result<(), TransportError>;
}

/// 读完并丢弃整条流的传输实现，用于未配置采集端的场景与测试。
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardTransport;

#[async_trait]
impl Transport for DiscardTransport {
    async fn send_stream(
        &self,
        _cancel: Cancellation,
        mut stream: StreamReader,
    ) -> Result<(), TransportError> {
        let mut sink = tokio::io::sink();
        tokio::io::copy(&mut stream, &mut sink).await?;
        Ok(())
    }
}
