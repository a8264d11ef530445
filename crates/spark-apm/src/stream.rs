//! 按需拉取的请求流。
//!
//! # 教案式说明
//! - **意图（Why）**：请求体可能远大于内存中愿意保留的量，因此不预先物化完整请求，
//!   而是由传输侧每次读取时向事件循环“要”一块压缩输出；
//! - **逻辑（How）**：[`StreamReader`] 实现 [`AsyncRead`]，每次缺数据时发出一个
//!   [`ReadRequest`]（附带一次性回执通道），同一时刻至多一个请求未决，形成单槽交接；
//!   循环以 [`ReadChunk`] 作答，最后一块带 `eof` 标记；
//! - **契约（What）**：回执通道被丢弃或请求通道关闭都视为流结束（读取返回 0），
//!   这正是追踪器关闭时传输侧观察到的“优雅 EOF”。

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};

/// 传输侧发出的读请求。
#[derive(Debug)]
pub(crate) struct ReadRequest {
    pub(crate) max_len: usize,
    pub(crate) reply: oneshot::Sender<ReadChunk>,
}

/// 循环对读请求的应答。
#[derive(Debug, Default)]
pub(crate) struct ReadChunk {
    pub(crate) data: Bytes,
    pub(crate) eof: bool,
}

/// 传输实现读取的请求流。
#[derive(Debug)]
pub struct StreamReader {
    requests: mpsc::UnboundedSender<ReadRequest>,
    pending: Option<oneshot::Receiver<ReadChunk>>,
    leftover: Bytes,
    eof: bool,
}

impl StreamReader {
    /// 创建读取端及循环持有的请求接收端。
    pub(crate) fn channel() -> (StreamReader, mpsc::UnboundedReceiver<ReadRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        let reader = StreamReader {
            requests,
            pending: None,
            leftover: Bytes::new(),
            eof: false,
        };
        (reader, rx)
    }
}

impl AsyncRead for StreamReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.leftover.is_empty() {
                let n = this.leftover.len().min(buf.remaining());
                buf.put_slice(&this.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if this.pending.is_none() {
                let (reply, rx) = oneshot::channel();
                let request = ReadRequest {
                    max_len: buf.remaining(),
                    reply,
                };
                if this.requests.send(request).is_err() {
                    this.eof = true;
                    continue;
                }
                this.pending = Some(rx);
            }
            let Some(pending) = this.pending.as_mut() else {
                continue;
            };

            match Pin::new(pending).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(chunk)) => {
                    this.pending = None;
                    this.leftover = chunk.data;
                    this.eof = chunk.eof;
                }
                Poll::Ready(Err(_)) => {
                    this.pending = None;
                    this.eof = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn reader_pulls_chunks_until_eof() {
        let (mut reader, mut requests) = StreamReader::channel();
        let server = tokio::spawn(async move {
            let chunks = [(&b"hello "[..], false), (&b"world"[..], true)];
            for (data, eof) in chunks {
                let request = requests.recv().await.expect("读取端应发出请求");
                assert!(request.max_len > 0);
                let _ = request.reply.send(ReadChunk {
                    data: Bytes::from_static(data),
                    eof,
                });
            }
        });

        let mut body = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut body))
            .await
            .expect("读取应在超时前结束")
            .expect("读取不应失败");
        assert_eq!(body, b"hello world");
        server.await.expect("应答任务");
    }

    #[tokio::test]
    async fn dropped_request_side_reads_as_eof() {
        let (mut reader, requests) = StreamReader::channel();
        drop(requests);
        let mut body = Vec::new();
        let n = reader.read_to_end(&mut body).await.expect("关闭即 EOF");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn unanswered_request_reads_as_eof_once_reply_is_dropped() {
        let (mut reader, mut requests) = StreamReader::channel();
        let closer = tokio::spawn(async move {
            let request = requests.recv().await.expect("读取端应发出请求");
            drop(request);
        });
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.expect("丢弃回执即 EOF");
        assert_eq!(n, 0);
        closer.await.expect("关闭任务");
    }
}
