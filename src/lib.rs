//! # tao-packet
//!
//! Tao 多媒体框架的压缩数据包层: 可复用的数据包与引用计数负载缓冲区.
//!
//! - **缓冲区**: 引用计数, 释放回调与分配器成对绑定
//! - **数据包**: 时间戳/流索引/标志位元数据, 负载缓冲区跨数据包复用
//! - **日志**: 基于 tracing 的控制台 + 按日滚动文件输出
//!
//! # 快速开始
//!
//! ```rust
//! use tao_packet::codec::Packet;
//!
//! let mut pkt = Packet::with_payload(1024).unwrap();
//! pkt.write_payload(|buf| buf[..3].copy_from_slice(b"abc"));
//! pkt.set_complete(true, 3);
//! pkt.set_key_packet(true);
//! assert!(pkt.is_complete() && pkt.is_key_packet());
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `tao-core` | 错误类型、时间基、引用计数缓冲区 |
//! | `tao-codec` | 数据包与监听器 |

/// 核心类型与缓冲区 (对标 libavutil)
pub use tao_core as core;

/// 压缩数据包 (对标 libavcodec 的 AVPacket)
pub use tao_codec as codec;

pub mod logging;

/// 获取版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
