//! 引用计数字节缓冲区.
//!
//! 对标 FFmpeg 的 `AVBufferRef`: 多个持有者共享同一块固定容量的内存,
//! 最后一个持有者释放时, 通过创建时绑定的释放回调归还内存.
//!
//! 由分配器创建的缓冲区会把释放回调绑定到同一个分配器实例,
//! 保证内存总是由分配它的那一族函数回收.
//!
//! 缓冲区可在 `capacity()` 之后携带一段隐藏的清零填充, 读写守卫只暴露
//! `[0, capacity)`, 填充区只能通过 `with_padded()` 只读访问.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, trace};

use crate::error::{TaoError, TaoResult};

/// 缓冲区内存释放回调
///
/// 最后一个 [`Buffer`] 句柄释放时调用一次, 参数为缓冲区的底层内存.
pub type ReleaseFn = Box<dyn FnOnce(Box<[u8]>) + Send + Sync>;

/// 缓冲区分配器
///
/// `allocate` 与 `release` 必须成对: 由 `allocate` 得到的内存只能交还给同一分配器的 `release`.
pub trait BufferAllocator: Send + Sync {
    /// 分配器名称 (用于日志)
    fn name(&self) -> &str;

    /// 分配 `size` 字节并清零
    ///
    /// # 返回
    /// - `Err(TaoError::OutOfMemory)`: 内存不足
    fn allocate(&self, size: usize) -> TaoResult<Box<[u8]>>;

    /// 归还由 `allocate` 分配的内存
    fn release(&self, data: Box<[u8]>);
}

/// 基于全局分配器的默认实现
///
/// 使用可失败的内存预留, 分配失败时返回错误而不是终止进程.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl BufferAllocator for SystemAllocator {
    fn name(&self) -> &str {
        "system"
    }

    fn allocate(&self, size: usize) -> TaoResult<Box<[u8]>> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|e| TaoError::OutOfMemory(format!("请求 {size} 字节: {e}")))?;
        data.resize(size, 0);
        Ok(data.into_boxed_slice())
    }

    fn release(&self, data: Box<[u8]>) {
        trace!("归还系统缓冲区, {} 字节", data.len());
        drop(data);
    }
}

/// 创建默认分配器
pub fn default_allocator() -> Arc<dyn BufferAllocator> {
    Arc::new(SystemAllocator)
}

struct BufferInner {
    data: RwLock<Box<[u8]>>,
    capacity: usize,
    release: Option<ReleaseFn>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            let slot = self.data.get_mut().unwrap_or_else(PoisonError::into_inner);
            release(std::mem::take(slot));
        }
    }
}

/// 引用计数字节缓冲区
///
/// `clone()` 只增加引用计数, 不复制数据. 容量在创建后固定不变.
/// 数据通过读写守卫访问, 多个句柄同时存在时依然保持一致.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// 从已有内存创建缓冲区, 并绑定释放回调
    pub fn with_release<F>(data: Box<[u8]>, release: F) -> Self
    where
        F: FnOnce(Box<[u8]>) + Send + Sync + 'static,
    {
        let capacity = data.len();
        Self::from_parts(data, capacity, Some(Box::new(release)))
    }

    /// 通过分配器创建 `size` 字节的清零缓冲区
    ///
    /// 释放回调绑定到同一个分配器.
    pub fn allocate(size: usize, allocator: &Arc<dyn BufferAllocator>) -> TaoResult<Self> {
        Self::allocate_padded(size, 0, allocator)
    }

    /// 通过分配器创建容量为 `capacity`、其后另带 `padding` 字节隐藏填充的缓冲区
    ///
    /// 填充区清零且不计入容量, 读写守卫无法写入, 因此始终保持为 0.
    ///
    /// # 返回
    /// - `Err(TaoError::OutOfMemory)`: 分配失败或总大小溢出
    pub fn allocate_padded(
        capacity: usize,
        padding: usize,
        allocator: &Arc<dyn BufferAllocator>,
    ) -> TaoResult<Self> {
        let total = capacity.checked_add(padding).ok_or_else(|| {
            TaoError::OutOfMemory(format!("请求 {capacity} + {padding} 字节, 超出地址空间"))
        })?;
        let mut data = allocator.allocate(total)?;
        if data.len() != total {
            let got = data.len();
            allocator.release(data);
            return Err(TaoError::Internal(format!(
                "分配器 {} 返回了 {got} 字节, 请求为 {total} 字节",
                allocator.name()
            )));
        }
        // 分配器未必清零, 填充区必须为 0
        data[capacity..].fill(0);
        debug!(
            "分配缓冲区: 容量 {} 字节, 填充 {} 字节, 分配器={}",
            capacity,
            padding,
            allocator.name()
        );
        let owner = Arc::clone(allocator);
        Ok(Self::from_parts(
            data,
            capacity,
            Some(Box::new(move |data| owner.release(data))),
        ))
    }

    /// 使用默认分配器创建 `size` 字节的清零缓冲区
    pub fn zeroed(size: usize) -> TaoResult<Self> {
        Self::allocate(size, &default_allocator())
    }

    fn from_parts(data: Box<[u8]>, capacity: usize, release: Option<ReleaseFn>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                data: RwLock::new(data),
                capacity,
                release,
            }),
        }
    }

    /// 缓冲区容量 (字节)
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// 容量之后的隐藏填充字节数
    pub fn padding(&self) -> usize {
        self.read_all().len() - self.capacity()
    }

    /// 当前持有者数量
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// 两个句柄是否指向同一块缓冲区
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// 获取 `[0, capacity)` 的只读访问
    ///
    /// 守卫持有内部读锁. 持有期间在同一线程上调用任何需要写入的操作
    /// (`write()`、`copy_from_slice()`, 以及持有该缓冲区的数据包的
    /// `allocate_new_payload()`/`wrap_copy()`/`write_payload()`) 会死锁,
    /// 调用前必须先释放守卫.
    pub fn read(&self) -> BufferReadGuard<'_> {
        BufferReadGuard {
            guard: self.read_all(),
            len: self.capacity(),
        }
    }

    /// 获取 `[0, capacity)` 的可写访问
    ///
    /// 守卫持有内部写锁. 持有期间在同一线程上再次访问该缓冲区
    /// (包括通过数据包读取负载) 会死锁.
    pub fn write(&self) -> BufferWriteGuard<'_> {
        BufferWriteGuard {
            guard: self.inner.data.write().unwrap_or_else(PoisonError::into_inner),
            len: self.capacity(),
        }
    }

    /// 只读访问包含隐藏填充在内的全部内存
    ///
    /// 供会越过负载末尾读取的解码器使用. 锁的约束与 `read()` 相同.
    pub fn with_padded<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.read_all())
    }

    fn read_all(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.inner.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 将 `src` 写入 `offset` 处
    pub fn copy_from_slice(&self, offset: usize, src: &[u8]) -> TaoResult<()> {
        let end = self.check_range(offset, src.len())?;
        self.write()[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// 复制 `[offset, offset + len)` 区间的数据
    pub fn to_vec(&self, offset: usize, len: usize) -> TaoResult<Vec<u8>> {
        let end = self.check_range(offset, len)?;
        Ok(self.read()[offset..end].to_vec())
    }

    fn check_range(&self, offset: usize, len: usize) -> TaoResult<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity() => Ok(end),
            _ => Err(TaoError::InvalidArgument(format!(
                "访问越界: offset={offset}, len={len}, capacity={}",
                self.capacity()
            ))),
        }
    }
}

impl From<Vec<u8>> for Buffer {
    /// 接管 `Vec` 的内存, 释放时直接丢弃
    fn from(data: Vec<u8>) -> Self {
        let capacity = data.len();
        Self::from_parts(data.into_boxed_slice(), capacity, None)
    }
}

/// [`Buffer::read`] 返回的只读守卫, 解引用为 `[0, capacity)`
pub struct BufferReadGuard<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
    len: usize,
}

impl Deref for BufferReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len]
    }
}

/// [`Buffer::write`] 返回的可写守卫, 解引用为 `[0, capacity)`
pub struct BufferWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, Box<[u8]>>,
    len: usize,
}

impl Deref for BufferWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len]
    }
}

impl DerefMut for BufferWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..self.len]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("padding", &self.padding())
            .field("ref_count", &self.ref_count())
            .field("has_release", &self.inner.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录分配/归还次数的分配器
    #[derive(Default)]
    struct CountingAllocator {
        allocated: AtomicUsize,
        released: AtomicUsize,
    }

    impl BufferAllocator for CountingAllocator {
        fn name(&self) -> &str {
            "counting"
        }

        fn allocate(&self, size: usize) -> TaoResult<Box<[u8]>> {
            self.allocated.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0u8; size].into_boxed_slice())
        }

        fn release(&self, _data: Box<[u8]>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_buffer_释放回调只调用一次() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let buffer = Buffer::with_release(vec![7u8; 16].into_boxed_slice(), move |data| {
            assert_eq!(data.len(), 16);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let other = buffer.clone();
        assert_eq!(buffer.ref_count(), 2);

        drop(buffer);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        drop(other);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffer_分配器对称归还() {
        let counting = Arc::new(CountingAllocator::default());
        let allocator: Arc<dyn BufferAllocator> = counting.clone();

        let buffer = Buffer::allocate(32, &allocator).expect("分配失败");
        assert_eq!(buffer.capacity(), 32);
        assert_eq!(counting.allocated.load(Ordering::SeqCst), 1);
        assert_eq!(counting.released.load(Ordering::SeqCst), 0);

        drop(buffer);
        assert_eq!(counting.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffer_共享句柄可见写入() {
        let buffer = Buffer::zeroed(8).expect("分配失败");
        let alias = buffer.clone();
        buffer.copy_from_slice(2, &[1, 2, 3]).expect("写入失败");
        assert_eq!(alias.to_vec(0, 6).expect("读取失败"), vec![0, 0, 1, 2, 3, 0]);
        assert!(Buffer::ptr_eq(&buffer, &alias));
    }

    #[test]
    fn test_buffer_越界访问返回错误() {
        let buffer = Buffer::from(vec![0u8; 4]);
        assert!(matches!(
            buffer.copy_from_slice(3, &[1, 2]),
            Err(TaoError::InvalidArgument(_))
        ));
        assert!(buffer.to_vec(usize::MAX, 2).is_err());
    }

    /// 分配器返回脏内存时, 隐藏填充区也必须为 0
    struct DirtyAllocator;

    impl BufferAllocator for DirtyAllocator {
        fn name(&self) -> &str {
            "dirty"
        }

        fn allocate(&self, size: usize) -> TaoResult<Box<[u8]>> {
            Ok(vec![0xAA; size].into_boxed_slice())
        }

        fn release(&self, _data: Box<[u8]>) {}
    }

    #[test]
    fn test_buffer_隐藏填充清零且不可写() {
        let allocator: Arc<dyn BufferAllocator> = Arc::new(DirtyAllocator);
        let buffer = Buffer::allocate_padded(16, 8, &allocator).expect("分配失败");
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.padding(), 8);

        // 写满整个容量, 填充区不受影响
        buffer.write().fill(0xFF);
        assert_eq!(buffer.write().len(), 16);
        assert_eq!(buffer.read().len(), 16);
        buffer.with_padded(|all| {
            assert_eq!(all.len(), 24);
            assert!(all[..16].iter().all(|&b| b == 0xFF));
            assert!(all[16..].iter().all(|&b| b == 0));
        });
        assert!(buffer.copy_from_slice(16, &[1]).is_err());
    }

    #[test]
    fn test_buffer_填充大小溢出返回内存不足() {
        let allocator = default_allocator();
        let result = Buffer::allocate_padded(usize::MAX, 1, &allocator);
        assert!(matches!(result, Err(TaoError::OutOfMemory(_))));
    }

    #[test]
    fn test_system_allocator_超大请求返回内存不足() {
        let result = SystemAllocator.allocate(usize::MAX);
        assert!(matches!(result, Err(TaoError::OutOfMemory(_))));
    }
}
