//! `spark-ringbuffer` 提供定长容量的字节块环形缓冲。
//!
//! # 模块定位（Why）
//! - 为遥测代理提供“永不阻塞、永不报错”的暂存区：生产者写入速度超过发送速度时，
//!   以丢弃最旧数据换取宿主进程的活性；
//! - 淘汰通知以构造时注入的函数值表达，缓冲本身不感知任何业务分类，便于独立测试与复用。
//!
//! # 设计概要（How）
//! - `ring` 模块实现 [`RingBuffer`]：单块连续内存，块头（标签 + 长度）与负载内联存放，
//!   写入越界时回绕；
//! - [`BlockTag`] 为不透明的一字节标签，由上层 crate 赋予业务含义；
//! - 块自描述（自带长度），因此可以逐块流式写出，不依赖相邻块。
//!
//! # 契约说明（What）
//! - 所有操作均为同步、非阻塞；缓冲不是 `Sync` 共享结构，调用方需保证单一访问者。

mod ring;

pub use ring::{BLOCK_HEADER_LEN, BlockHeader, BlockTag, EvictionHook, RingBuffer, RingBufferError};
