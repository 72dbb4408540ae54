//! # tao-codec
//!
//! Tao 多媒体框架的压缩数据包层, 提供可复用的 [`Packet`] 及其负载缓冲管理.
//!
//! 本 crate 对标 FFmpeg libavcodec 中的 `AVPacket` 部分.
//!
//! ## 使用示例
//!
//! ```rust
//! use tao_codec::{Packet, RawPacket};
//!
//! let src = RawPacket::from_data(vec![0u8, 1, 2, 3]);
//! let mut pkt = Packet::from_raw(&src).unwrap();
//! assert!(pkt.is_complete());
//! assert_eq!(pkt.size(), 4);
//!
//! // 复用同一块缓冲区承载下一个数据包
//! pkt.allocate_new_payload(2).unwrap();
//! pkt.write_payload(|buf| buf[..2].copy_from_slice(&[9, 9]));
//! pkt.set_complete(true, 2);
//! ```

pub mod listener;
pub mod packet;
pub mod raw_packet;

// 重导出常用类型
pub use listener::{PacketListener, PassThroughListener};
pub use packet::{INPUT_BUFFER_PADDING_SIZE, Packet};
pub use raw_packet::{PacketFlags, RawPacket};
