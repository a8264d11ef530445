//! `eviction_contract` 集成测试：从公开 API 视角验证环形缓冲的淘汰与读出契约。
//!
//! # 测试目标（Why）
//! - 淘汰是唯一的背压手段，丢弃计数必须精确，否则上层统计会失真；
//! - 读出顺序必须严格 FIFO，且块标签与长度在进出缓冲时保持不变。

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use spark_ringbuffer::{BLOCK_HEADER_LEN, BlockHeader, BlockTag, RingBuffer, RingBufferError};

fn recording(capacity: usize) -> (RingBuffer, Arc<Mutex<Vec<BlockHeader>>>) {
    let evicted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&evicted);
    let buffer = RingBuffer::with_eviction_hook(
        capacity,
        Box::new(move |header| sink.lock().expect("淘汰记录锁").push(header)),
    );
    (buffer, evicted)
}

fn drain(buffer: &mut RingBuffer) -> Vec<(BlockTag, Vec<u8>)> {
    let mut blocks = Vec::new();
    loop {
        let mut payload = Vec::new();
        match buffer.write_block_to(&mut payload) {
            Ok(header) => {
                assert_eq!(header.len as usize, payload.len(), "块长度应与负载一致");
                blocks.push((header.tag, payload));
            }
            Err(RingBufferError::Empty) => return blocks,
            Err(err) => panic!("读出失败: {err}"),
        }
    }
}

/// 三个事务、两个错误写入恰好容纳四个等长块的缓冲：只淘汰最早的事务。
#[test]
fn five_equal_blocks_into_room_for_four_evicts_first_transaction() {
    const TX: BlockTag = BlockTag(1);
    const ERR: BlockTag = BlockTag(3);
    let payload_len = 16;
    let (mut buffer, evicted) = recording(4 * (BLOCK_HEADER_LEN + payload_len));

    for (index, tag) in [TX, TX, TX, ERR, ERR].into_iter().enumerate() {
        buffer.insert(tag, &[index as u8; 16]);
    }

    let evicted = evicted.lock().expect("淘汰记录锁").clone();
    assert_eq!(
        evicted,
        vec![BlockHeader {
            tag: TX,
            len: payload_len as u32
        }]
    );
    let remaining = drain(&mut buffer);
    let tags: Vec<_> = remaining.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec![TX, TX, ERR, ERR]);
    assert_eq!(remaining[0].1, vec![1u8; 16], "剩余首块应为第二个事务");
}

#[test]
fn counters_track_every_block_leaving_the_buffer() {
    let (mut buffer, _) = recording(2 * (BLOCK_HEADER_LEN + 1));
    for _ in 0..5 {
        buffer.insert(BlockTag(2), b"x");
    }
    assert_eq!(buffer.inserted_total(), 5);
    assert_eq!(buffer.removed_total(), 3);
    drain(&mut buffer);
    assert_eq!(buffer.removed_total(), 5);
    assert_eq!(buffer.len(), 0);
}

proptest! {
    /// FIFO 淘汰律：N 个等长块写入容纳 C 块的缓冲，恰好淘汰 N−C 个，剩余为最近写入的 C 个。
    #[test]
    fn fifo_eviction_law(count in 0usize..64, room in 1usize..16, payload_len in 0usize..24) {
        let (mut buffer, evicted) = recording(room * (BLOCK_HEADER_LEN + payload_len));
        for index in 0..count {
            let mut payload = vec![0u8; payload_len];
            if let Some(first) = payload.first_mut() {
                *first = index as u8;
            }
            buffer.insert(BlockTag((index % 4) as u8), &payload);
            prop_assert!(buffer.len() <= buffer.capacity());
        }

        let expected_drops = count.saturating_sub(room);
        prop_assert_eq!(evicted.lock().expect("淘汰记录锁").len(), expected_drops);

        let remaining = drain(&mut buffer);
        prop_assert_eq!(remaining.len(), count - expected_drops);
        for (offset, (tag, payload)) in remaining.iter().enumerate() {
            let index = expected_drops + offset;
            prop_assert_eq!(*tag, BlockTag((index % 4) as u8));
            prop_assert_eq!(payload.len(), payload_len);
            if payload_len > 0 {
                prop_assert_eq!(payload[0], index as u8);
            }
        }
    }

    /// 变长块往返：写入后在淘汰前读出，标签与长度保持不变。
    #[test]
    fn blocks_round_trip_before_eviction(lens in proptest::collection::vec(0usize..200, 1..32)) {
        let capacity: usize = lens.iter().map(|len| BLOCK_HEADER_LEN + len).sum();
        let (mut buffer, evicted) = recording(capacity);
        for (index, len) in lens.iter().enumerate() {
            buffer.insert(BlockTag(index as u8), &vec![7u8; *len]);
        }
        prop_assert!(evicted.lock().expect("淘汰记录锁").is_empty());
        let remaining = drain(&mut buffer);
        prop_assert_eq!(remaining.len(), lens.len());
        for (index, (tag, payload)) in remaining.iter().enumerate() {
            prop_assert_eq!(*tag, BlockTag(index as u8));
            prop_assert_eq!(payload.len(), lens[index]);
        }
    }
}
