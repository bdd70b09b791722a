use crate::core::{AudioFrame, Packet, VideoFrame};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 可以放进 BufferQueue 复用的对象
pub trait BufferItem: Default + Send + 'static {
    /// 清空内容以便复用（保留已分配的容量）
    fn reset(&mut self);
    fn pts(&self) -> i64;
    fn duration(&self) -> i64;
    fn serial(&self) -> u64;
    fn set_serial(&mut self, serial: u64);
    fn is_eof(&self) -> bool;
    fn set_eof(&mut self, eof: bool);
    fn byte_size(&self) -> usize;
}

impl BufferItem for Packet {
    fn reset(&mut self) {
        self.stream_index = 0;
        self.pts = 0;
        self.duration = 0;
        self.serial = 0;
        self.is_eof = false;
        self.is_key = false;
        self.raw_pts = None;
        self.raw_dts = None;
        self.data.clear();
    }

    fn pts(&self) -> i64 {
        self.pts
    }

    fn duration(&self) -> i64 {
        self.duration
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }

    fn is_eof(&self) -> bool {
        self.is_eof
    }

    fn set_eof(&mut self, eof: bool) {
        self.is_eof = eof;
    }

    fn byte_size(&self) -> usize {
        self.data.len()
    }
}

impl BufferItem for VideoFrame {
    fn reset(&mut self) {
        self.pts = 0;
        self.duration = 0;
        self.serial = 0;
        self.is_eof = false;
        self.texture = None;
        for plane in &mut self.planes {
            plane.data.clear();
        }
    }

    fn pts(&self) -> i64 {
        self.pts
    }

    fn duration(&self) -> i64 {
        self.duration
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }

    fn is_eof(&self) -> bool {
        self.is_eof
    }

    fn set_eof(&mut self, eof: bool) {
        self.is_eof = eof;
    }

    fn byte_size(&self) -> usize {
        self.payload_bytes()
    }
}

impl BufferItem for AudioFrame {
    fn reset(&mut self) {
        self.pts = 0;
        self.duration = 0;
        self.serial = 0;
        self.is_eof = false;
        self.pcm.clear();
    }

    fn pts(&self) -> i64 {
        self.pts
    }

    fn duration(&self) -> i64 {
        self.duration
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }

    fn is_eof(&self) -> bool {
        self.is_eof
    }

    fn set_eof(&mut self, eof: bool) {
        self.is_eof = eof;
    }

    fn byte_size(&self) -> usize {
        self.pcm.len()
    }
}

/// 队列中的一个缓冲：槽位编号 + 复用的对象
pub struct Buffer<T> {
    id: usize,
    item: T,
}

impl<T> Buffer<T> {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl<T> Deref for Buffer<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> DerefMut for Buffer<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

/// 队列容量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCapacity {
    Fixed(usize),
    Unbounded,
}

impl QueueCapacity {
    fn allows(&self, allocated: usize) -> bool {
        match self {
            QueueCapacity::Fixed(max) => allocated < *max,
            QueueCapacity::Unbounded => true,
        }
    }
}

impl From<Option<usize>> for QueueCapacity {
    fn from(value: Option<usize>) -> Self {
        match value {
            Some(max) => QueueCapacity::Fixed(max),
            None => QueueCapacity::Unbounded,
        }
    }
}

/// 队列事件（在锁外通知）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// 有新的可读缓冲
    NewReadable,
    /// 有缓冲回到写池
    NewWritable,
    /// 可读缓冲被整体冲刷，serial 已递增
    Flushed,
}

pub type QueueListener = Arc<dyn Fn(QueueEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Readable,
    Writable,
    InFlight,
    Freed,
}

struct QueueInner<T> {
    slots: Vec<SlotState>,
    readable: VecDeque<Buffer<T>>,
    writable: Vec<Buffer<T>>,
    /// 当前存活（未释放）的缓冲数
    allocated: usize,
    /// 超出容量的强制分配次数
    forced: usize,
    total_duration: i64,
    total_bytes: usize,
    released: bool,
}

impl<T: BufferItem> QueueInner<T> {
    fn allocate(&mut self) -> Buffer<T> {
        let id = self.slots.len();
        self.slots.push(SlotState::InFlight);
        self.allocated += 1;
        Buffer {
            id,
            item: T::default(),
        }
    }

    fn free(&mut self, buffer: Buffer<T>) {
        if let Some(slot) = self.slots.get_mut(buffer.id) {
            if *slot != SlotState::Freed {
                *slot = SlotState::Freed;
                self.allocated = self.allocated.saturating_sub(1);
            }
        }
    }

    fn set_slot(&mut self, id: usize, state: SlotState) {
        if let Some(slot) = self.slots.get_mut(id) {
            debug_assert_ne!(*slot, SlotState::Freed, "缓冲 {} 已释放", id);
            *slot = state;
        }
    }
}

/// 两个对象池（可读 FIFO + 写池）组成的缓冲队列
///
/// - 每个缓冲只分配一次，之后在 "写池 → 生产者 → 可读队列 → 消费者 → 写池" 之间循环
/// - 数据包队列在入队时打上当前 serial；`flush_readable_buffer` 使 serial 递增
/// - 监听器在释放锁之后调用，回调里可以安全地再次访问队列
pub struct BufferQueue<T> {
    name: String,
    capacity: QueueCapacity,
    stamp_serial: bool,
    serial: Arc<AtomicU64>,
    inner: Mutex<QueueInner<T>>,
    listeners: Mutex<Vec<QueueListener>>,
}

pub type PacketQueue = BufferQueue<Packet>;
pub type VideoFrameQueue = BufferQueue<VideoFrame>;
pub type AudioFrameQueue = BufferQueue<AudioFrame>;

impl<T: BufferItem> BufferQueue<T> {
    fn with_options(name: impl Into<String>, capacity: QueueCapacity, stamp_serial: bool) -> Self {
        Self {
            name: name.into(),
            capacity,
            stamp_serial,
            serial: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(QueueInner {
                slots: Vec::new(),
                readable: VecDeque::new(),
                writable: Vec::new(),
                allocated: 0,
                forced: 0,
                total_duration: 0,
                total_bytes: 0,
                released: false,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// 帧队列：serial 由解码器写入
    pub fn new(name: impl Into<String>, capacity: QueueCapacity) -> Self {
        Self::with_options(name, capacity, false)
    }

    /// 数据包队列：入队时打上当前 serial
    pub fn for_packets(name: impl Into<String>, capacity: QueueCapacity) -> Self {
        Self::with_options(name, capacity, true)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> QueueCapacity {
        self.capacity
    }

    pub fn add_listener(&self, listener: QueueListener) {
        self.listeners.lock().push(listener);
    }

    fn notify(&self, event: QueueEvent) {
        let listeners: Vec<QueueListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(event);
        }
    }

    /// 当前 serial
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// 共享的 serial（时钟绑定用）
    pub fn serial_handle(&self) -> Arc<AtomicU64> {
        self.serial.clone()
    }

    /// 取一个可写缓冲：优先复用，容量未满时新分配，否则返回 None
    pub fn dequeue_writable(&self) -> Option<Buffer<T>> {
        let mut inner = self.inner.lock();
        if inner.released {
            return None;
        }
        if let Some(mut buffer) = inner.writable.pop() {
            inner.set_slot(buffer.id, SlotState::InFlight);
            buffer.item.reset();
            return Some(buffer);
        }
        if self.capacity.allows(inner.allocated) {
            return Some(inner.allocate());
        }
        None
    }

    /// 必要时超出容量分配（EOF 标记等必须送达的场景）；队列释放后返回 None
    pub fn dequeue_writable_force(&self) -> Option<Buffer<T>> {
        let mut inner = self.inner.lock();
        if inner.released {
            return None;
        }
        if let Some(mut buffer) = inner.writable.pop() {
            inner.set_slot(buffer.id, SlotState::InFlight);
            buffer.item.reset();
            return Some(buffer);
        }
        if !self.capacity.allows(inner.allocated) {
            inner.forced += 1;
            debug!("{} ⚠️ 队列 {} 超出容量强制分配（第 {} 次）", log_ctx(), self.name, inner.forced);
        }
        Some(inner.allocate())
    }

    /// 是否还能拿到可写缓冲
    pub fn has_writable(&self) -> bool {
        let inner = self.inner.lock();
        !inner.released && (!inner.writable.is_empty() || self.capacity.allows(inner.allocated))
    }

    /// 放入可读队列尾部
    pub fn enqueue_readable(&self, mut buffer: Buffer<T>) {
        {
            let mut inner = self.inner.lock();
            if inner.released {
                inner.free(buffer);
                return;
            }
            if self.stamp_serial {
                buffer.item.set_serial(self.serial.load(Ordering::Acquire));
            }
            inner.total_duration += buffer.item.duration().max(0);
            inner.total_bytes += buffer.item.byte_size();
            inner.set_slot(buffer.id, SlotState::Readable);
            inner.readable.push_back(buffer);
        }
        self.notify(QueueEvent::NewReadable);
    }

    /// 取出可读队列头部
    pub fn dequeue_readable(&self) -> Option<Buffer<T>> {
        let mut inner = self.inner.lock();
        let buffer = inner.readable.pop_front()?;
        inner.total_duration = (inner.total_duration - buffer.item.duration().max(0)).max(0);
        inner.total_bytes = inner.total_bytes.saturating_sub(buffer.item.byte_size());
        inner.set_slot(buffer.id, SlotState::InFlight);
        Some(buffer)
    }

    /// 查看可读队列头部（不出队）
    pub fn peek_readable<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.peek_readable_at(0, f)
    }

    /// 查看可读队列第 `index` 个缓冲
    pub fn peek_readable_at<R>(&self, index: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.readable.get(index).map(|b| f(&b.item))
    }

    /// 归还到写池
    pub fn enqueue_writable(&self, buffer: Buffer<T>) {
        {
            let mut inner = self.inner.lock();
            if inner.released {
                inner.free(buffer);
                return;
            }
            inner.set_slot(buffer.id, SlotState::Writable);
            inner.writable.push(buffer);
        }
        self.notify(QueueEvent::NewWritable);
    }

    /// 把所有可读缓冲退回写池，serial 递增，累计值清零；返回冲刷数量
    pub fn flush_readable_buffer(&self) -> usize {
        let (flushed, serial) = {
            let mut inner = self.inner.lock();
            let drained: Vec<Buffer<T>> = inner.readable.drain(..).collect();
            let flushed = drained.len();
            for buffer in drained {
                inner.set_slot(buffer.id, SlotState::Writable);
                inner.writable.push(buffer);
            }
            inner.total_duration = 0;
            inner.total_bytes = 0;
            let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
            (flushed, serial)
        };
        debug!("{} 🧹 队列 {} 冲刷 {} 个缓冲，serial → {}", log_ctx(), self.name, flushed, serial);
        if flushed > 0 {
            self.notify(QueueEvent::NewWritable);
        }
        self.notify(QueueEvent::Flushed);
        flushed
    }

    /// 释放全部缓冲；之后归还的缓冲直接释放。返回本次释放数量。
    pub fn release(&self) -> usize {
        let freed = {
            let mut inner = self.inner.lock();
            inner.released = true;
            let mut buffers: Vec<Buffer<T>> = inner.readable.drain(..).collect();
            buffers.extend(inner.writable.drain(..));
            let freed = buffers.len();
            for buffer in buffers {
                inner.free(buffer);
            }
            inner.total_duration = 0;
            inner.total_bytes = 0;
            freed
        };
        self.listeners.lock().clear();
        info!(
            "{} 🗑️ 队列 {} 已释放 {} 个缓冲（仍在外部的: {}）",
            log_ctx(),
            self.name,
            freed,
            self.allocated()
        );
        freed
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    pub fn readable_len(&self) -> usize {
        self.inner.lock().readable.len()
    }

    pub fn writable_len(&self) -> usize {
        self.inner.lock().writable.len()
    }

    /// 存活的缓冲总数
    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated
    }

    /// 在生产者/消费者手里的缓冲数
    pub fn in_flight(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .allocated
            .saturating_sub(inner.readable.len() + inner.writable.len())
    }

    pub fn forced_allocations(&self) -> usize {
        self.inner.lock().forced
    }

    /// 可读缓冲的累计时长（毫秒）
    pub fn total_duration(&self) -> i64 {
        self.inner.lock().total_duration
    }

    /// 可读缓冲的累计字节数
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}

pub type LeaseCallback<T> = Box<dyn FnOnce(&T, bool) + Send>;

/// 交给外部协作方（视频 sink / 音频设备）的帧
///
/// `finish(presented)` 或 drop 时回调恰好触发一次，随后缓冲回到写池。
pub struct FrameLease<T: BufferItem> {
    buffer: Option<Buffer<T>>,
    queue: Arc<BufferQueue<T>>,
    on_finish: Option<LeaseCallback<T>>,
}

impl<T: BufferItem> FrameLease<T> {
    pub fn new(buffer: Buffer<T>, queue: Arc<BufferQueue<T>>, on_finish: LeaseCallback<T>) -> Self {
        Self {
            buffer: Some(buffer),
            queue,
            on_finish: Some(on_finish),
        }
    }

    /// 完成：`presented` 表示是否真的被呈现/播放
    pub fn finish(mut self, presented: bool) {
        self.complete(presented);
    }

    fn complete(&mut self, presented: bool) {
        if let Some(buffer) = self.buffer.take() {
            if let Some(callback) = self.on_finish.take() {
                callback(&buffer.item, presented);
            }
            self.queue.enqueue_writable(buffer);
        }
    }
}

impl<T: BufferItem> Deref for FrameLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.buffer {
            Some(buffer) => &buffer.item,
            None => unreachable!("帧租约在完成后被访问"),
        }
    }
}

impl<T: BufferItem> Drop for FrameLease<T> {
    fn drop(&mut self) {
        self.complete(false);
    }
}
