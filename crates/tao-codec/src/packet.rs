//! 可复用的压缩数据包 (Packet).
//!
//! 在数据包描述符 (时间戳、流索引、标志位等) 之上持有一块引用计数的负载缓冲区.
//!
//! 三种填充方式:
//! - `allocate_new_payload()`: 按大小准备负载, 由调用方写入后 `set_complete()`
//! - `wrap_buffer()`: 零拷贝接管调用方的缓冲区
//! - `wrap_copy()`: 从外部 [`RawPacket`] 复制元数据与负载
//!
//! `reset()` 只清空描述符, 缓冲区保留给下一个数据包复用.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace, warn};
use tao_core::buffer::{BufferAllocator, default_allocator};
use tao_core::timestamp::NOPTS_VALUE;
use tao_core::{Buffer, Rational, TaoError, TaoResult, Timestamp};

use crate::raw_packet::{PacketFlags, RawPacket};

/// 负载末尾额外分配并清零的字节数
///
/// 部分解码器会越过负载末尾读取, 这段填充保证读到的都是 0.
pub const INPUT_BUFFER_PADDING_SIZE: usize = 64;

/// 数据包描述符
#[derive(Debug, Clone, Copy)]
struct PacketDescriptor {
    pts: i64,
    dts: i64,
    duration: i64,
    pos: i64,
    stream_index: i32,
    flags: PacketFlags,
    time_base: Rational,
    /// 有效负载字节数
    size: usize,
    /// 负载是否挂接到当前缓冲区
    attached: bool,
}

impl PacketDescriptor {
    const fn new() -> Self {
        Self {
            pts: NOPTS_VALUE,
            dts: NOPTS_VALUE,
            duration: 0,
            pos: -1,
            stream_index: 0,
            flags: PacketFlags::empty(),
            time_base: Rational::UNDEFINED,
            size: 0,
            attached: false,
        }
    }
}

/// 单槽缓冲池
///
/// 同一时刻只持有一个缓冲区; 容量足够时原地复用, 不足时才重新分配.
struct PayloadSlot {
    buffer: Option<Buffer>,
    allocator: Arc<dyn BufferAllocator>,
}

impl PayloadSlot {
    fn capacity(&self) -> Option<usize> {
        self.buffer.as_ref().map(Buffer::capacity)
    }

    /// 确保缓冲区至少能容纳 `size` 字节负载
    ///
    /// 新缓冲区容量为 `size + INPUT_BUFFER_PADDING_SIZE`, 其后再带同样大小的隐藏填充,
    /// 因此之后以满容量复用时负载末尾仍有清零的填充区.
    fn acquire(&mut self, size: usize) -> TaoResult<()> {
        if let Some(buffer) = self.buffer.as_ref().filter(|b| b.capacity() >= size) {
            trace!(
                "复用负载缓冲区: 需要 {} 字节, 容量 {} 字节, 隐藏填充 {} 字节",
                size,
                buffer.capacity(),
                buffer.padding()
            );
            let end = buffer.capacity().min(size.saturating_add(INPUT_BUFFER_PADDING_SIZE));
            buffer.write()[size..end].fill(0);
            return Ok(());
        }

        let total = size.checked_add(INPUT_BUFFER_PADDING_SIZE).ok_or_else(|| {
            TaoError::OutOfMemory(format!("负载 {size} 字节加填充超出地址空间"))
        })?;
        let buffer = Buffer::allocate_padded(total, INPUT_BUFFER_PADDING_SIZE, &self.allocator)?;
        // 分配器未必清零, 负载之后的区域必须为 0
        buffer.write()[size..].fill(0);
        debug!(
            "重新分配负载缓冲区: 负载 {} 字节, 容量 {} -> {} 字节",
            size,
            self.capacity().unwrap_or(0),
            total
        );
        // 旧缓冲区的引用在此释放
        self.buffer = Some(buffer);
        Ok(())
    }
}

/// 可复用的压缩数据包
///
/// 持有描述符与至多一个负载缓冲区. 描述符被 `close()` 释放后,
/// 所有访问器返回哨兵值 (整数为 -1, 布尔为 false), 修改操作变为空操作.
pub struct Packet {
    raw: Option<PacketDescriptor>,
    slot: PayloadSlot,
    complete: bool,
}

impl Packet {
    /// 创建空数据包 (无负载, 未完成)
    pub fn new() -> Self {
        Self::with_allocator(default_allocator())
    }

    /// 创建使用指定分配器的空数据包
    ///
    /// 之后 `allocate_new_payload()` 分配的缓冲区都由该分配器分配并归还.
    pub fn with_allocator(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            raw: Some(PacketDescriptor::new()),
            slot: PayloadSlot {
                buffer: None,
                allocator,
            },
            complete: false,
        }
    }

    /// 创建带 `size` 字节负载缓冲区的数据包
    ///
    /// 分配失败时已获取的资源全部释放, 返回错误.
    pub fn with_payload(size: usize) -> TaoResult<Self> {
        Self::with_payload_in(size, default_allocator())
    }

    /// 使用指定分配器创建带负载缓冲区的数据包
    pub fn with_payload_in(size: usize, allocator: Arc<dyn BufferAllocator>) -> TaoResult<Self> {
        let mut packet = Self::with_allocator(allocator);
        packet.allocate_new_payload(size)?;
        Ok(packet)
    }

    /// 零拷贝接管 `buffer`, 负载大小为缓冲区容量, 并标记为完成
    pub fn from_buffer(buffer: Buffer) -> Self {
        let mut packet = Self::new();
        packet.wrap_buffer(buffer);
        packet
    }

    /// 从外部数据包复制元数据与负载
    pub fn from_raw(raw: &RawPacket) -> TaoResult<Self> {
        let mut packet = Self::new();
        packet.wrap_copy(raw)?;
        Ok(packet)
    }

    /// 为新负载准备缓冲区
    ///
    /// 先 `reset()`, 当前缓冲区容量不小于 `size` 时原地复用,
    /// 否则分配 `size + INPUT_BUFFER_PADDING_SIZE` 字节的新缓冲区.
    /// 负载大小置 0, 等待调用方写入后通过 `set_complete(true, n)` 设置.
    ///
    /// 不能在持有本数据包缓冲区的读写守卫时调用, 否则同一线程上会死锁.
    ///
    /// # 返回
    /// - `Err(TaoError::OutOfMemory)`: 分配失败, 或 `size` 加填充后溢出
    /// - `Err(TaoError::Precondition)`: 描述符已释放
    pub fn allocate_new_payload(&mut self, size: usize) -> TaoResult<()> {
        if self.raw.is_none() {
            return Err(TaoError::Precondition(format!(
                "数据包已关闭, 无法分配 {size} 字节负载"
            )));
        }
        self.reset();
        if let Err(err) = self.slot.acquire(size) {
            warn!("分配数据包负载失败: {err}");
            return Err(err);
        }
        if let Some(raw) = self.raw.as_mut() {
            raw.attached = true;
            raw.size = 0;
        }
        self.set_complete(false, 0);
        Ok(())
    }

    /// 零拷贝接管 `buffer`
    ///
    /// 与当前缓冲区不同时先 `reset()` 并释放旧缓冲区的引用;
    /// 之后负载覆盖缓冲区全部容量, 并标记为完成.
    pub fn wrap_buffer(&mut self, buffer: Buffer) {
        if self.raw.is_none() {
            warn!("数据包已关闭, 忽略 wrap_buffer");
            return;
        }
        let same = self.data().is_some_and(|cur| Buffer::ptr_eq(cur, &buffer));
        if !same {
            self.reset();
            // 旧缓冲区的引用在此释放, 之后由本数据包独占持有
            self.slot.buffer = Some(buffer);
        }

        let capacity = self.slot.capacity().unwrap_or(0);
        if let Some(raw) = self.raw.as_mut() {
            raw.attached = true;
            raw.size = capacity;
        }
        self.set_complete(true, capacity);
    }

    /// 从外部数据包复制元数据与负载
    ///
    /// 负载总是复制到本数据包自己的缓冲区 (容量不足时扩容), 从不引用外部内存,
    /// 外部数据包之后的修改不会影响本数据包.
    pub fn wrap_copy(&mut self, src: &RawPacket) -> TaoResult<()> {
        let size = src.size();
        self.allocate_new_payload(size)?;
        let buffer = self
            .slot
            .buffer
            .as_ref()
            .ok_or_else(|| TaoError::Internal("分配负载后缺少缓冲区".into()))?;
        buffer.copy_from_slice(0, &src.data)?;

        if let Some(raw) = self.raw.as_mut() {
            raw.pts = src.pts;
            raw.dts = src.dts;
            raw.duration = src.duration;
            raw.pos = src.pos;
            raw.stream_index = src.stream_index;
            raw.flags = src.flags;
            raw.time_base = src.time_base;
            raw.attached = true;
        }
        self.set_complete(true, size);
        trace!("复制外部数据包: stream={}, {} 字节", src.stream_index, size);
        Ok(())
    }

    /// 清空描述符并标记为未完成
    ///
    /// 缓冲区保留, 后续 `allocate_new_payload()` 可直接复用.
    pub fn reset(&mut self) {
        if let Some(raw) = self.raw.as_mut() {
            *raw = PacketDescriptor::new();
        }
        self.set_complete(false, 0);
    }

    /// 提前释放描述符与缓冲区
    ///
    /// 可重复调用, 之后所有访问器返回哨兵值.
    pub fn close(&mut self) {
        if self.raw.take().is_some() {
            debug!("关闭数据包, 容量 {} 字节", self.slot.capacity().unwrap_or(0));
        }
        self.slot.buffer = None;
        self.complete = false;
    }

    /// 设置完成标志
    ///
    /// 标记为完成时同时设置负载大小. 大小可小于缓冲区容量,
    /// 超过容量时截断到容量.
    pub fn set_complete(&mut self, complete: bool, size: usize) {
        self.complete = complete;
        if !complete {
            return;
        }
        let capacity = self.slot.capacity().unwrap_or(0);
        if let Some(raw) = self.raw.as_mut() {
            if size > capacity {
                warn!("负载大小 {size} 超过缓冲区容量 {capacity}, 已截断");
            }
            raw.size = size.min(capacity);
        }
    }

    /// 负载是否已填充完毕, 可供消费
    pub fn is_complete(&self) -> bool {
        self.complete && self.raw.as_ref().is_some_and(|raw| raw.attached)
    }

    /// 显示时间戳, 描述符已释放时返回 -1
    pub fn pts(&self) -> i64 {
        self.raw.map_or(-1, |raw| raw.pts)
    }

    /// 设置显示时间戳
    pub fn set_pts(&mut self, pts: i64) {
        if let Some(raw) = self.descriptor_mut("set_pts") {
            raw.pts = pts;
        }
    }

    /// 解码时间戳, 描述符已释放时返回 -1
    pub fn dts(&self) -> i64 {
        self.raw.map_or(-1, |raw| raw.dts)
    }

    /// 设置解码时间戳
    pub fn set_dts(&mut self, dts: i64) {
        if let Some(raw) = self.descriptor_mut("set_dts") {
            raw.dts = dts;
        }
    }

    /// 有效负载大小 (字节), 描述符已释放时返回 -1
    pub fn size(&self) -> i64 {
        self.raw.map_or(-1, |raw| raw.size as i64)
    }

    /// 缓冲区容量 (字节), 没有缓冲区时返回 -1
    pub fn max_size(&self) -> i64 {
        self.slot.capacity().map_or(-1, |capacity| capacity as i64)
    }

    /// 所属流的索引, 描述符已释放时返回 -1
    pub fn stream_index(&self) -> i32 {
        self.raw.map_or(-1, |raw| raw.stream_index)
    }

    /// 设置所属流的索引
    pub fn set_stream_index(&mut self, stream_index: i32) {
        if let Some(raw) = self.descriptor_mut("set_stream_index") {
            raw.stream_index = stream_index;
        }
    }

    /// 标志位原始值, 描述符已释放时返回 -1
    pub fn flags(&self) -> i32 {
        self.raw.map_or(-1, |raw| raw.flags.bits())
    }

    /// 设置标志位原始值, 未知位原样保留
    pub fn set_flags(&mut self, flags: i32) {
        if let Some(raw) = self.descriptor_mut("set_flags") {
            raw.flags = PacketFlags::from_bits_retain(flags);
        }
    }

    /// 标志位, 描述符已释放时为空
    pub fn packet_flags(&self) -> PacketFlags {
        self.raw.map_or(PacketFlags::empty(), |raw| raw.flags)
    }

    /// 是否为关键帧
    pub fn is_key_packet(&self) -> bool {
        self.packet_flags().contains(PacketFlags::KEY)
    }

    /// 设置关键帧标志
    ///
    /// 注意: `set_key_packet(false)` 会清除 **所有** 标志位, 而不仅是关键帧位.
    /// 只想去掉关键帧位时请使用 `set_flags()`.
    pub fn set_key_packet(&mut self, key: bool) {
        if let Some(raw) = self.descriptor_mut("set_key_packet") {
            if key {
                raw.flags.insert(PacketFlags::KEY);
            } else {
                raw.flags = PacketFlags::empty();
            }
        }
    }

    /// 数据包时长 (以 time_base 为单位), 描述符已释放时返回 -1
    pub fn duration(&self) -> i64 {
        self.raw.map_or(-1, |raw| raw.duration)
    }

    /// 设置数据包时长
    pub fn set_duration(&mut self, duration: i64) {
        if let Some(raw) = self.descriptor_mut("set_duration") {
            raw.duration = duration;
        }
    }

    /// 在容器中的字节偏移量, 未知或描述符已释放时返回 -1
    pub fn position(&self) -> i64 {
        self.raw.map_or(-1, |raw| raw.pos)
    }

    /// 设置在容器中的字节偏移量
    pub fn set_position(&mut self, pos: i64) {
        if let Some(raw) = self.descriptor_mut("set_position") {
            raw.pos = pos;
        }
    }

    /// 时间基, 描述符已释放时为 `Rational::UNDEFINED`
    pub fn time_base(&self) -> Rational {
        self.raw.map_or(Rational::UNDEFINED, |raw| raw.time_base)
    }

    /// 设置时间基
    pub fn set_time_base(&mut self, time_base: Rational) {
        if let Some(raw) = self.descriptor_mut("set_time_base") {
            raw.time_base = time_base;
        }
    }

    /// 以时间基表示的显示时间戳
    pub fn timestamp(&self) -> Timestamp {
        self.raw
            .map_or(Timestamp::none(), |raw| Timestamp::new(raw.pts, raw.time_base))
    }

    /// 当前持有的负载缓冲区
    pub fn data(&self) -> Option<&Buffer> {
        self.slot.buffer.as_ref()
    }

    /// 只读访问有效负载 `[0, size)`, 未挂接负载时返回 `None`
    ///
    /// 闭包执行期间持有缓冲区读锁, 闭包内不能写入同一缓冲区
    /// (例如通过调用方保留的 [`Buffer`] 句柄调用 `write()`), 否则会死锁.
    pub fn read_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let raw = self.raw.as_ref().filter(|raw| raw.attached)?;
        let buffer = self.slot.buffer.as_ref()?;
        let data = buffer.read();
        let payload = data.get(..raw.size)?;
        Some(f(payload))
    }

    /// 写入负载, 可写区域为整个缓冲区容量 (不含隐藏填充)
    ///
    /// 写完后调用 `set_complete(true, n)` 确定有效大小.
    ///
    /// 闭包执行期间持有缓冲区写锁. 闭包内通过任何句柄再次访问同一缓冲区
    /// (`read()`/`write()`/`to_vec()` 等), 或调用方在持有该缓冲区守卫时调用本方法,
    /// 都会在同一线程上死锁.
    pub fn write_payload<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.raw.as_ref().filter(|raw| raw.attached)?;
        let buffer = self.slot.buffer.as_ref()?;
        let mut data = buffer.write();
        Some(f(&mut data[..]))
    }

    /// 复制出有效负载
    pub fn payload_bytes(&self) -> Option<Bytes> {
        self.read_payload(Bytes::copy_from_slice)
    }

    /// 导出为外部数据包, 未完成时负载为空, 描述符已释放时返回 `None`
    pub fn to_raw(&self) -> Option<RawPacket> {
        let raw = self.raw?;
        let data = if self.is_complete() {
            self.payload_bytes().unwrap_or_default()
        } else {
            Bytes::new()
        };
        Some(RawPacket {
            data,
            pts: raw.pts,
            dts: raw.dts,
            duration: raw.duration,
            time_base: raw.time_base,
            stream_index: raw.stream_index,
            flags: raw.flags,
            pos: raw.pos,
        })
    }

    fn descriptor_mut(&mut self, op: &str) -> Option<&mut PacketDescriptor> {
        if self.raw.is_none() {
            warn!("数据包已关闭, 忽略 {op}");
        }
        self.raw.as_mut()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("raw", &self.raw)
            .field("buffer", &self.slot.buffer)
            .field("allocator", &self.slot.allocator.name())
            .field("complete", &self.complete)
            .finish()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(raw) = self.raw else {
            return write!(f, "Packet[已关闭]");
        };
        write!(
            f,
            "Packet[stream={}, pts={}, dts={}, duration={}, size={}, key={}, complete={}]",
            raw.stream_index,
            DisplayTs(raw.pts),
            DisplayTs(raw.dts),
            raw.duration,
            raw.size,
            raw.flags.contains(PacketFlags::KEY),
            self.is_complete()
        )
    }
}

/// 时间戳显示, 未定义值显示为 NOPTS
struct DisplayTs(i64);

impl fmt::Display for DisplayTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == NOPTS_VALUE {
            write!(f, "NOPTS")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_新建为空() {
        let pkt = Packet::new();
        assert!(!pkt.is_complete());
        assert_eq!(pkt.size(), 0);
        assert_eq!(pkt.max_size(), -1);
        assert_eq!(pkt.pts(), NOPTS_VALUE);
        assert_eq!(pkt.position(), -1);
        assert!(pkt.data().is_none());
        assert!(pkt.read_payload(|p| p.len()).is_none());
    }

    #[test]
    fn test_packet_新分配缓冲区包含清零填充() {
        let pkt = Packet::with_payload(10).expect("分配失败");
        let buffer = pkt.data().expect("缺少缓冲区");
        assert_eq!(buffer.capacity(), 10 + INPUT_BUFFER_PADDING_SIZE);
        assert!(buffer.read().iter().all(|&b| b == 0));
        // 填充区不计入负载大小
        assert_eq!(pkt.size(), 0);
    }

    #[test]
    fn test_packet_复用时清零新负载之后的填充区() {
        let mut pkt = Packet::with_payload(100).expect("分配失败");
        pkt.write_payload(|buf| buf.fill(0xAB)).expect("负载未挂接");
        pkt.set_complete(true, 100);

        pkt.allocate_new_payload(20).expect("复用失败");
        let buffer = pkt.data().expect("缺少缓冲区");
        let data = buffer.read();
        assert!(data[..20].iter().all(|&b| b == 0xAB));
        assert!(data[20..20 + INPUT_BUFFER_PADDING_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_packet_满容量复用时仍有清零填充() {
        let mut pkt = Packet::with_payload(10).expect("分配失败");
        let capacity = pkt.data().expect("缺少缓冲区").capacity();
        pkt.write_payload(|buf| buf.fill(0xCD)).expect("负载未挂接");
        pkt.set_complete(true, capacity);

        pkt.allocate_new_payload(capacity).expect("复用失败");
        let buffer = pkt.data().expect("缺少缓冲区");
        assert_eq!(buffer.capacity(), capacity);
        assert!(buffer.padding() >= INPUT_BUFFER_PADDING_SIZE);
        buffer.with_padded(|all| {
            assert!(all[..capacity].iter().all(|&b| b == 0xCD));
            assert!(all[capacity..].iter().all(|&b| b == 0));
        });
    }

    #[test]
    fn test_packet_负载大小溢出返回内存不足() {
        let mut pkt = Packet::new();
        for size in [
            usize::MAX,
            usize::MAX - INPUT_BUFFER_PADDING_SIZE + 1,
            usize::MAX - INPUT_BUFFER_PADDING_SIZE,
        ] {
            assert!(matches!(
                pkt.allocate_new_payload(size),
                Err(TaoError::OutOfMemory(_))
            ));
            assert!(!pkt.is_complete());
        }
    }

    #[test]
    fn test_packet_完成大小超过容量时截断() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut pkt = Packet::from_buffer(Buffer::from(vec![1u8; 8]));
        pkt.set_complete(true, 1000);
        assert_eq!(pkt.size(), 8);
    }

    #[test]
    fn test_packet_写入后读取负载() {
        let mut pkt = Packet::with_payload(4).expect("分配失败");
        let written = pkt.write_payload(|buf| {
            buf[..4].copy_from_slice(b"tao!");
            4
        });
        assert_eq!(written, Some(4));
        pkt.set_complete(true, 4);
        assert_eq!(pkt.payload_bytes().as_deref(), Some(&b"tao!"[..]));
    }

    #[test]
    fn test_packet_关闭可重复调用() {
        let mut pkt = Packet::with_payload(16).expect("分配失败");
        pkt.close();
        pkt.close();
        assert_eq!(pkt.size(), -1);
        assert_eq!(pkt.max_size(), -1);
        assert_eq!(pkt.to_string(), "Packet[已关闭]");
        assert!(matches!(
            pkt.allocate_new_payload(4),
            Err(TaoError::Precondition(_))
        ));
    }

    #[test]
    fn test_packet_显示摘要() {
        let mut pkt = Packet::from_buffer(Buffer::from(vec![0u8; 3]));
        pkt.set_stream_index(1);
        pkt.set_pts(90);
        pkt.set_key_packet(true);
        assert_eq!(
            pkt.to_string(),
            "Packet[stream=1, pts=90, dts=NOPTS, duration=0, size=3, key=true, complete=true]"
        );
    }
}
