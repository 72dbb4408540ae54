//! # tao-core
//!
//! Tao 多媒体框架核心库, 提供基础类型定义、错误处理和引用计数缓冲区.
//!
//! 本 crate 对标 FFmpeg 的 libavutil, 为数据包层提供底层基础设施.

pub mod buffer;
pub mod error;
pub mod rational;
pub mod timestamp;

// 重导出常用类型
pub use buffer::{
    Buffer, BufferAllocator, BufferReadGuard, BufferWriteGuard, ReleaseFn, SystemAllocator,
};
pub use error::{TaoError, TaoResult};
pub use rational::Rational;
pub use timestamp::Timestamp;
