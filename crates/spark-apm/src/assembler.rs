//! 压缩请求流的组装。
//!
//! # 教案式说明
//! - **意图（Why）**：缓冲中的块需要被增量压缩进当前请求，并按传输侧的读取节奏逐块交付，
//!   内存占用只与“已压缩但尚未被读走”的字节数相关；
//! - **逻辑（How）**：
//!   1. [`StreamAssembler::open`] 新建 zlib 编码器并写入缓存的元数据行；
//!   2. [`StreamAssembler::write_block`] 从环形缓冲取出最旧的块，追加换行后写入编码器；
//!   3. [`StreamAssembler::flush`] 做同步刷新，使已写入的记录尽快可读；
//!      [`StreamAssembler::close`] 写入 zlib 尾部，此后不再接受块；
//!   4. [`StreamAssembler::take_chunk`] 按读请求的上限切出压缩输出，最后一块附带 EOF；
//! - **契约（What）**：
//!   - 请求大小上限以“写入编码器的未压缩字节数”（含元数据与换行）计量，
//!     但每个请求至少携带一个块，上限小于元数据长度时请求仍能推进；
//!   - 仅凭 zlib 头部（2 字节）不足以构成有意义的应答，因此累计可交付字节不超过头长时不作答。

use std::io::{self, Write};

use bytes::buf::Writer;
use bytes::{BufMut, BytesMut};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use spark_ringbuffer::{BlockHeader, RingBuffer, RingBufferError};

use crate::stream::ReadChunk;
use crate::writer::{ERROR_BLOCK_TAG, METRICSET_BLOCK_TAG, SPAN_BLOCK_TAG, TRANSACTION_BLOCK_TAG};

const ZLIB_HEADER_LEN: usize = 2;

/// 当前请求中各类别的块数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RequestCounts {
    pub(crate) transactions: u64,
    pub(crate) spans: u64,
    pub(crate) errors: u64,
    pub(crate) metricsets: u64,
}

impl RequestCounts {
    /// 来自追踪缓冲的块数。
    pub(crate) fn trace_blocks(&self) -> u64 {
        self.transactions + self.spans + self.errors
    }

    pub(crate) fn total(&self) -> u64 {
        self.trace_blocks() + self.metricsets
    }

    fn record(&mut self, header: BlockHeader) {
        match header.tag {
            TRANSACTION_BLOCK_TAG => self.transactions += 1,
            SPAN_BLOCK_TAG => self.spans += 1,
            ERROR_BLOCK_TAG => self.errors += 1,
            METRICSET_BLOCK_TAG => self.metricsets += 1,
            _ => {}
        }
    }
}

fn new_encoder() -> ZlibEncoder<Writer<BytesMut>> {
    ZlibEncoder::new(BytesMut::new().writer(), Compression::fast())
}

pub(crate) struct StreamAssembler {
    encoder: ZlibEncoder<Writer<BytesMut>>,
    active: bool,
    flushed: bool,
    closed: bool,
    written: usize,
    bytes_read: usize,
    counts: RequestCounts,
}

impl StreamAssembler {
    pub(crate) fn new() -> Self {
        Self {
            encoder: new_encoder(),
            active: false,
            flushed: true,
            closed: false,
            written: 0,
            bytes_read: 0,
            counts: RequestCounts::default(),
        }
    }

    /// 开始新请求并写入元数据行。
    pub(crate) fn open(&mut self, metadata: &[u8]) -> io::Result<()> {
        self.encoder = new_encoder();
        self.active = true;
        self.flushed = false;
        self.closed = false;
        self.bytes_read = 0;
        self.counts = RequestCounts::default();
        self.written = metadata.len();
        self.encoder.write_all(metadata)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// 已写入编码器的未压缩字节数。
    pub(crate) fn written(&self) -> usize {
        self.written
    }

    pub(crate) fn counts(&self) -> RequestCounts {
        self.counts
    }

    /// 将缓冲中最旧的块写入请求。块在任何情况下都会离开缓冲。
    pub(crate) fn write_block(
        &mut self,
        buffer: &mut RingBuffer,
    ) -> Result<BlockHeader, RingBufferError> {
        let header = buffer.write_block_to(&mut self.encoder)?;
        self.encoder.write_all(b"\n")?;
        self.written += header.len as usize + 1;
        self.flushed = false;
        self.counts.record(header);
        Ok(header)
    }

    /// 同步刷新：让已写入的记录立即成为可读的压缩输出。
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        if self.flushed || self.closed {
            return Ok(());
        }
        self.flushed = true;
        self.encoder.flush()
    }

    pub(crate) fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// 写入 zlib 尾部并结束请求体。
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.encoder.try_finish()
    }

    fn output(&mut self) -> &mut BytesMut {
        self.encoder.get_mut().get_mut()
    }

    /// 已压缩、尚未被读走的字节数。
    pub(crate) fn pending_len(&self) -> usize {
        self.encoder.get_ref().get_ref().len()
    }

    /// 为一个读请求切出至多 `max_len` 字节；当前不宜作答时返回 `None`。
    pub(crate) fn take_chunk(&mut self, max_len: usize) -> Option<ReadChunk> {
        let pending = self.pending_len();
        if pending == 0 || self.bytes_read + pending <= ZLIB_HEADER_LEN {
            return None;
        }
        let n = pending.min(max_len.max(1));
        let data = self.output().split_to(n).freeze();
        self.bytes_read += n;
        let eof = self.closed && self.pending_len() == 0;
        Some(ReadChunk { data, eof })
    }

    /// 请求结束（成功或失败）后回到空闲状态。
    pub(crate) fn reset(&mut self) {
        self.encoder = new_encoder();
        self.active = false;
        self.flushed = true;
        self.closed = false;
        self.written = 0;
        self.bytes_read = 0;
        self.counts = RequestCounts::default();
    }
}
