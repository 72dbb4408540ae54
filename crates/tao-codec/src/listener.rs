//! 数据包监听器.
//!
//! 在数据包送入解码器之前、以及编码器产出之后插入处理逻辑,
//! 例如改写流索引、丢弃损坏的数据包等. 默认实现原样透传.

use crate::packet::Packet;

/// 数据包监听器 trait
pub trait PacketListener: Send {
    /// 数据包送入解码器之前调用
    fn pre_decode(&mut self, packet: Packet) -> Packet {
        packet
    }

    /// 编码器产出数据包之后调用
    fn post_encode(&mut self, packet: Packet) -> Packet {
        packet
    }
}

/// 原样透传的监听器
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughListener;

impl PacketListener for PassThroughListener {}

#[cfg(test)]
mod tests {
    use super::*;
    use tao_core::Buffer;

    /// 将数据包改写到指定流, 并统计经过的数量
    struct Remap {
        stream_index: i32,
        seen: usize,
    }

    impl PacketListener for Remap {
        fn pre_decode(&mut self, mut packet: Packet) -> Packet {
            self.seen += 1;
            packet.set_stream_index(self.stream_index);
            packet
        }
    }

    #[test]
    fn test_listener_默认透传() {
        let mut listener = PassThroughListener;
        let pkt = Packet::from_buffer(Buffer::from(vec![1u8, 2, 3]));
        let buffer = pkt.data().cloned().expect("缺少缓冲区");

        let pkt = listener.pre_decode(pkt);
        let pkt = listener.post_encode(pkt);
        assert!(pkt.is_complete());
        assert!(Buffer::ptr_eq(pkt.data().expect("缺少缓冲区"), &buffer));
    }

    #[test]
    fn test_listener_改写流索引() {
        let mut listener = Remap {
            stream_index: 3,
            seen: 0,
        };
        let pkt = listener.pre_decode(Packet::new());
        assert_eq!(pkt.stream_index(), 3);
        // post_encode 未覆盖, 保持默认透传
        let pkt = listener.post_encode(pkt);
        assert_eq!(pkt.stream_index(), 3);
        assert_eq!(listener.seen, 1);
    }
}
