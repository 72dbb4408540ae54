//! 外部数据包描述符 (RawPacket).
//!
//! 对标 FFmpeg 的 `AVPacket`, 表示解封装器或编码器产出的一帧压缩数据.
//! 其负载内存由产出方管理, [`crate::Packet::wrap_copy`] 只复制, 从不引用.

use bitflags::bitflags;
use bytes::Bytes;
use tao_core::Rational;
use tao_core::timestamp::NOPTS_VALUE;

bitflags! {
    /// 数据包标志位, 取值与 `AV_PKT_FLAG_*` 一致
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: i32 {
        /// 关键帧, 解码不依赖之前的帧
        const KEY        = 0x0001;
        /// 数据已损坏
        const CORRUPT    = 0x0002;
        /// 解码后应丢弃 (仅用于维持解码器状态)
        const DISCARD    = 0x0004;
        /// 数据来源可信
        const TRUSTED    = 0x0008;
        /// 可丢弃帧 (不被其他帧参考)
        const DISPOSABLE = 0x0010;
    }
}

/// 外部压缩数据包
///
/// 一个 RawPacket 通常对应一帧视频或若干帧音频的压缩数据.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// 压缩数据
    pub data: Bytes,
    /// 显示时间戳 (PTS)
    pub pts: i64,
    /// 解码时间戳 (DTS)
    pub dts: i64,
    /// 数据包时长 (以 time_base 为单位)
    pub duration: i64,
    /// 时间基
    pub time_base: Rational,
    /// 所属流的索引
    pub stream_index: i32,
    /// 标志位
    pub flags: PacketFlags,
    /// 在容器中的字节偏移量 (-1 表示未知)
    pub pos: i64,
}

impl RawPacket {
    /// 创建空数据包
    pub fn empty() -> Self {
        Self {
            data: Bytes::new(),
            pts: NOPTS_VALUE,
            dts: NOPTS_VALUE,
            duration: 0,
            time_base: Rational::UNDEFINED,
            stream_index: 0,
            flags: PacketFlags::empty(),
            pos: -1,
        }
    }

    /// 从数据创建数据包
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::empty()
        }
    }

    /// 数据大小 (字节)
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 是否为空包 (flush packet)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 是否为关键帧
    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(PacketFlags::KEY)
    }
}

impl Default for RawPacket {
    fn default() -> Self {
        Self::empty()
    }
}
