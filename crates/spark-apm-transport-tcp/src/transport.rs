use std::time::Duration;

use async_trait::async_trait;
use spark_apm::{Cancellation, StreamReader, Transport, TransportError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{StatusLineError, connect_timed_out};
use crate::status::{classify, parse_status_line};

/// 建连超时的缺省值。
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_STATUS_LINE_LEN: u64 = 1024;

/// 每次发送新建一条 TCP 连接的流式传输。
///
/// # 教案式说明
/// - **意图（Why）**：请求体由代理按需增量产出，传输侧只需把它边读边写到套接字；
/// - **逻辑（How）**：建连 → `copy` 请求流到写半部 → 半关闭写方向 → 读取一行应答并分类；
/// - **契约（What）**：请求流结束即表示请求体完整；取消后不再等待应答，直接返回成功。
#[derive(Clone, Debug)]
pub struct TcpStreamTransport {
    addr: String,
    connect_timeout: Duration,
}

impl TcpStreamTransport {
    /// `addr` 形如 `host:port`，每次发送时重新解析。
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr.as_str()))
            .await
        {
            Ok(connected) => Ok(connected?),
            Err(_) => Err(connect_timed_out(&self.addr)),
        }
    }
}

#[async_trait]
impl Transport for TcpStreamTransport {
    async fn send_stream(
        &self,
        cancel: Cancellation,
        mut stream: StreamReader,
    ) -> Result<(), TransportError> {
        let socket = self.connect().await?;
        let (read_half, mut write_half) = socket.into_split();

        let sent = tokio::io::copy(&mut stream, &mut write_half).await?;
        write_half.shutdown().await?;
        tracing::debug!(
            target: "spark_apm_transport_tcp",
            addr = %self.addr,
            bytes = sent,
            "request stream written"
        );

        let mut response = BufReader::new(read_half).take(MAX_STATUS_LINE_LEN);
        let mut line = String::new();
        tokio::select! {
            read = response.read_line(&mut line) => {
                if read? == 0 {
                    return Err(StatusLineError::Missing.into());
                }
            }
            () = cancel.cancelled() => return Ok(()),
        }

        let (status, message) = parse_status_line(&line)?;
        classify(status, message)
    }
}
