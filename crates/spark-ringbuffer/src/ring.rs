use std::fmt;
use std::io::{self, Write};

use thiserror::Error;

/// 块头在缓冲内占用的字节数：1 字节标签 + 4 字节小端长度。
pub const BLOCK_HEADER_LEN: usize = 5;

/// 块标签，由上层赋予业务含义（例如事务、Span、错误、指标）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockTag(pub u8);

/// 块头：标签与负载长度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub tag: BlockTag,
    pub len: u32,
}

impl BlockHeader {
    fn encode(self) -> [u8; BLOCK_HEADER_LEN] {
        let len = self.len.to_le_bytes();
        [self.tag.0, len[0], len[1], len[2], len[3]]
    }

    fn decode(raw: [u8; BLOCK_HEADER_LEN]) -> Self {
        Self {
            tag: BlockTag(raw[0]),
            len: u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]),
        }
    }

    /// 块在缓冲中占用的总字节数（含块头）。
    pub fn stored_len(&self) -> usize {
        BLOCK_HEADER_LEN + self.len as usize
    }
}

/// 淘汰回调：每淘汰一个块调用一次，仅携带块头，负载已被丢弃。
pub type EvictionHook = Box<dyn FnMut(BlockHeader) + Send>;

/// 环形缓冲读取路径的错误。
#[derive(Debug, Error)]
pub enum RingBufferError {
    /// 缓冲内没有任何块。
    #[error("ring buffer is empty")]
    Empty,
    /// 向目标写出块时发生 IO 错误；块已被移出缓冲。
    #[error("failed to write block: {0}")]
    Io(#[from] io::Error),
}

/// 定长字节块环形缓冲。
///
/// # 教案式说明
/// - **意图（Why）**：生产者永不因缓冲已满而阻塞或失败；容量不足时按插入顺序淘汰最旧块，
///   并通过淘汰回调交由上层做丢弃统计。
/// - **逻辑（How）**：
///   1. `storage` 为一次性分配的连续内存，`head` 指向最旧块的块头，`used` 为已占用字节；
///   2. 写入时先循环淘汰直至剩余空间足够，再写入块头与负载，越过末尾时回绕到起点；
///   3. [`RingBuffer::write_block_to`] 移出最旧块并写入目标，保证严格的 FIFO 顺序；
///   4. `inserted_total`/`removed_total` 单调递增，供上层判断某一时刻之前写入的块是否都已离开缓冲。
/// - **契约（What）**：
///   - 任意时刻 `len() <= capacity()`；
///   - 单块（含块头）大于容量时无法存放，该块被视为“立即淘汰”并触发回调；
///   - 所有方法均 O(1) 摊还，不阻塞、不返回写入错误。
/// - **权衡（Trade-offs）**：容量在构造时固定，不支持运行时扩缩；以复制进出换取零碎片。
pub struct RingBuffer {
    storage: Box<[u8]>,
    head: usize,
    used: usize,
    blocks: usize,
    inserted_total: u64,
    removed_total: u64,
    evicted: Option<EvictionHook>,
}

impl RingBuffer {
    /// 创建不带淘汰回调的缓冲。
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            used: 0,
            blocks: 0,
            inserted_total: 0,
            removed_total: 0,
            evicted: None,
        }
    }

    /// 创建缓冲并注入淘汰回调。
    pub fn with_eviction_hook(capacity: usize, hook: EvictionHook) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.evicted = Some(hook);
        buffer
    }

    /// 容量（字节）。
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// 当前已占用的字节数（含块头）。
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    /// 当前驻留的块数量。
    pub fn block_count(&self) -> usize {
        self.blocks
    }

    /// 累计写入的块数量（含因过大被立即淘汰的块）。
    pub fn inserted_total(&self) -> u64 {
        self.inserted_total
    }

    /// 累计离开缓冲的块数量（被读出或被淘汰）。
    pub fn removed_total(&self) -> u64 {
        self.removed_total
    }

    /// 写入一个块；空间不足时淘汰最旧块直至可以容纳。
    pub fn insert(&mut self, tag: BlockTag, payload: &[u8]) {
        self.inserted_total += 1;
        let header = match u32::try_from(payload.len()) {
            Ok(len) => BlockHeader { tag, len },
            Err(_) => {
                self.removed_total += 1;
                self.notify_evicted(BlockHeader {
                    tag,
                    len: u32::MAX,
                });
                return;
            }
        };
        let stored = header.stored_len();
        if stored > self.capacity() {
            self.removed_total += 1;
            self.notify_evicted(header);
            return;
        }
        while self.capacity() - self.used < stored {
            self.evict_oldest();
        }

        let tail = self.offset(self.used);
        self.copy_in(tail, &header.encode());
        let payload_at = self.offset(self.used + BLOCK_HEADER_LEN);
        self.copy_in(payload_at, payload);
        self.used += stored;
        self.blocks += 1;
    }

    /// 移出最旧的块并写入 `sink`，返回其块头。
    ///
    /// 即便写出失败，块也已离开缓冲；调用方无需也无法重试同一块。
    pub fn write_block_to<W: Write + ?Sized>(
        &mut self,
        sink: &mut W,
    ) -> Result<BlockHeader, RingBufferError> {
        let header = self.peek_header().ok_or(RingBufferError::Empty)?;
        let start = self.offset(BLOCK_HEADER_LEN);
        let (first, second) = self.segments(start, header.len as usize);
        let written = sink.write_all(first).and_then(|_| sink.write_all(second));
        self.advance(header);
        written?;
        Ok(header)
    }

    fn evict_oldest(&mut self) {
        if let Some(header) = self.peek_header() {
            self.advance(header);
            self.notify_evicted(header);
        }
    }

    fn peek_header(&self) -> Option<BlockHeader> {
        if self.blocks == 0 {
            return None;
        }
        let mut raw = [0u8; BLOCK_HEADER_LEN];
        let (first, second) = self.segments(self.head, BLOCK_HEADER_LEN);
        raw[..first.len()].copy_from_slice(first);
        raw[first.len()..].copy_from_slice(second);
        Some(BlockHeader::decode(raw))
    }

    fn advance(&mut self, header: BlockHeader) {
        let stored = header.stored_len();
        self.head = self.offset(stored);
        self.used -= stored;
        self.blocks -= 1;
        self.removed_total += 1;
        if self.blocks == 0 {
            self.head = 0;
        }
    }

    fn notify_evicted(&mut self, header: BlockHeader) {
        if let Some(hook) = self.evicted.as_mut() {
            hook(header);
        }
    }

    /// 相对 `head` 偏移 `delta` 字节后的绝对位置。
    fn offset(&self, delta: usize) -> usize {
        let capacity = self.capacity();
        if capacity == 0 {
            0
        } else {
            (self.head + delta) % capacity
        }
    }

    fn copy_in(&mut self, at: usize, data: &[u8]) {
        let first = data.len().min(self.capacity() - at);
        self.storage[at..at + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.storage[..rest].copy_from_slice(&data[first..]);
    }

    fn segments(&self, at: usize, len: usize) -> (&[u8], &[u8]) {
        let first = len.min(self.capacity() - at);
        (
            &self.storage[at..at + first],
            &self.storage[..len - first],
        )
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.used)
            .field("blocks", &self.blocks)
            .field("inserted_total", &self.inserted_total)
            .field("removed_total", &self.removed_total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const TX: BlockTag = BlockTag(1);
    const ERR: BlockTag = BlockTag(3);

    fn recording(capacity: usize) -> (RingBuffer, Arc<Mutex<Vec<BlockHeader>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let buffer = RingBuffer::with_eviction_hook(
            capacity,
            Box::new(move |header| sink.lock().expect("淘汰记录锁").push(header)),
        );
        (buffer, evicted)
    }

    #[test]
    fn wraps_payload_across_the_end_of_storage() {
        let (mut buffer, evicted) = recording(2 * (BLOCK_HEADER_LEN + 4) + 3);
        buffer.insert(TX, b"aaaa");
        buffer.insert(TX, b"bbbb");
        let mut out = Vec::new();
        buffer.write_block_to(&mut out).expect("读出首块");
        assert_eq!(out, b"aaaa");

        // 第三块必然跨越末尾回绕。
        buffer.insert(ERR, b"cccc");
        assert!(evicted.lock().expect("淘汰记录锁").is_empty());

        let mut out = Vec::new();
        assert_eq!(buffer.write_block_to(&mut out).expect("读出").tag, TX);
        assert_eq!(out, b"bbbb");
        let mut out = Vec::new();
        let header = buffer.write_block_to(&mut out).expect("读出回绕块");
        assert_eq!(header, BlockHeader { tag: ERR, len: 4 });
        assert_eq!(out, b"cccc");
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn oversized_block_is_reported_as_evicted() {
        let (mut buffer, evicted) = recording(8);
        buffer.insert(ERR, b"0123456789");
        assert!(buffer.is_empty());
        assert_eq!(
            evicted.lock().expect("淘汰记录锁").as_slice(),
            &[BlockHeader { tag: ERR, len: 10 }]
        );
        assert_eq!(buffer.inserted_total(), 1);
        assert_eq!(buffer.removed_total(), 1);
    }

    #[test]
    fn zero_capacity_drops_everything() {
        let (mut buffer, evicted) = recording(0);
        buffer.insert(TX, b"");
        assert!(buffer.is_empty());
        assert_eq!(evicted.lock().expect("淘汰记录锁").len(), 1);
        assert!(matches!(
            buffer.write_block_to(&mut Vec::new()),
            Err(RingBufferError::Empty)
        ));
    }

    #[test]
    fn failed_sink_still_removes_block() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("sink closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = RingBuffer::new(64);
        buffer.insert(TX, b"payload");
        assert!(matches!(
            buffer.write_block_to(&mut Broken),
            Err(RingBufferError::Io(_))
        ));
        assert!(buffer.is_empty());
        assert_eq!(buffer.removed_total(), 1);
    }
}
