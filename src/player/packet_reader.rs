use crate::core::{MediaKind, Packet, PlayerConfig, Result};
use crate::player::backend::{MediaBackend, ReadPacketResult};
use crate::player::buffer_queue::{BufferItem, PacketQueue, QueueEvent};
use crate::player::events::PipelineEvents;
use crate::player::looper::Looper;
use crate::player::sink::SubtitleSink;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 读包线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    NotInit,
    Ready,
    /// 队列已满，等待解码器归还缓冲
    WaitingWritableBuffer,
    Eof,
    Released,
}

#[derive(Debug, Clone, PartialEq)]
enum ReaderMessage {
    ReadPkt,
    Seek { target_ms: i64, seek_id: u64 },
}

/// 读包限流阈值
#[derive(Debug, Clone)]
struct QueueLimits {
    max_bytes: usize,
    min_packets: usize,
    min_duration_ms: i64,
}

/// 已从后端读出、但对应队列暂时没有可写缓冲的包
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingDelivery {
    kind: MediaKind,
    attachment: bool,
}

#[derive(Default)]
struct ReaderSession {
    /// 包仍留在后端，下一轮优先送出
    pending_delivery: Option<PendingDelivery>,
    video_eof_sent: bool,
    audio_eof_sent: bool,
    video_packets: usize,
    audio_packets: usize,
    subtitle_packets: usize,
    read_failures: usize,
}

impl ReaderSession {
    fn eof_sent(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video_eof_sent,
            MediaKind::Audio => self.audio_eof_sent,
        }
    }

    fn mark_eof_sent(&mut self, kind: MediaKind) {
        match kind {
            MediaKind::Video => self.video_eof_sent = true,
            MediaKind::Audio => self.audio_eof_sent = true,
        }
    }
}

/// 读包阶段
///
/// 在自己的消息线程上循环调用后端 `read_packet`，把包分发到音视频数据包队列：
/// - 队列足够满时进入 WaitingWritableBuffer，等解码器归还缓冲再继续
/// - 文件结束时给每条还没收到 EOF 的流推一个 EOF 标记包
/// - Seek 请求串行执行：成功后冲刷两个队列（serial 递增），并上报结果
pub struct PacketReader {
    state: Mutex<ReaderState>,
    /// 持有期间才会调用后端
    session: Mutex<ReaderSession>,
    backend: Arc<dyn MediaBackend>,
    video_queue: Option<Arc<PacketQueue>>,
    audio_queue: Option<Arc<PacketQueue>>,
    video_is_attachment: bool,
    subtitle_sink: Option<Arc<dyn SubtitleSink>>,
    events: PipelineEvents,
    limits: QueueLimits,
    looper: Looper<ReaderMessage>,
}

impl PacketReader {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        video_queue: Option<Arc<PacketQueue>>,
        audio_queue: Option<Arc<PacketQueue>>,
        video_is_attachment: bool,
        subtitle_sink: Option<Arc<dyn SubtitleSink>>,
        events: PipelineEvents,
        config: &PlayerConfig,
    ) -> Result<Arc<Self>> {
        let (looper, mailbox) = Looper::new("packet-reader");
        let reader = Arc::new(Self {
            state: Mutex::new(ReaderState::NotInit),
            session: Mutex::new(ReaderSession::default()),
            backend,
            video_queue,
            audio_queue,
            video_is_attachment,
            subtitle_sink,
            events,
            limits: QueueLimits {
                max_bytes: config.max_packet_queue_bytes,
                min_packets: config.min_queue_packets,
                min_duration_ms: config.min_queue_duration_ms,
            },
            looper,
        });

        let weak = Arc::downgrade(&reader);
        reader.looper.spawn(mailbox, move |msg| {
            if let Some(reader) = weak.upgrade() {
                reader.handle_message(msg);
            }
        })?;

        // 解码器归还缓冲时唤醒
        for queue in reader.queues().map(|(_, q)| q) {
            let weak = Arc::downgrade(&reader);
            queue.add_listener(Arc::new(move |event| {
                if event == QueueEvent::NewWritable {
                    if let Some(reader) = weak.upgrade() {
                        reader.on_writable_available();
                    }
                }
            }));
        }
        Ok(reader)
    }

    fn queues(&self) -> impl Iterator<Item = (MediaKind, &Arc<PacketQueue>)> {
        self.video_queue
            .iter()
            .map(|q| (MediaKind::Video, q))
            .chain(self.audio_queue.iter().map(|q| (MediaKind::Audio, q)))
    }

    fn queue_for(&self, kind: MediaKind) -> Option<&Arc<PacketQueue>> {
        match kind {
            MediaKind::Video => self.video_queue.as_ref(),
            MediaKind::Audio => self.audio_queue.as_ref(),
        }
    }

    pub fn state(&self) -> ReaderState {
        *self.state.lock()
    }

    /// 只有当前处于 `from` 时才切换
    fn transition(&self, from: ReaderState, to: ReaderState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// 开始读包
    pub fn start(&self) {
        if self.transition(ReaderState::NotInit, ReaderState::Ready) {
            info!("{} 🎬 读包线程启动: {}", log_ctx(), self.backend.description());
            self.request_read_pkt();
        }
    }

    /// 投递一轮读包（已有待处理的读包消息时合并）
    pub fn request_read_pkt(&self) {
        self.looper.post_replacing(ReaderMessage::ReadPkt);
    }

    /// 请求 seek；结果通过 `PipelineEvents::seek_finished` 上报
    pub fn request_seek(&self, target_ms: i64, seek_id: u64) {
        info!("{} ⏩ 读包线程收到 Seek 请求: {}ms (#{})", log_ctx(), target_ms, seek_id);
        self.looper.post(ReaderMessage::Seek { target_ms, seek_id });
    }

    /// 停止读包线程；返回后不会再调用后端
    pub fn release(&self) {
        *self.state.lock() = ReaderState::Released;
        self.looper.quit();
        let session = self.session.lock();
        info!(
            "{} 🛑 读包线程退出（视频 {} 包，音频 {} 包，字幕 {} 包）",
            log_ctx(),
            session.video_packets,
            session.audio_packets,
            session.subtitle_packets
        );
    }

    fn on_writable_available(&self) {
        if self.transition(ReaderState::WaitingWritableBuffer, ReaderState::Ready) {
            self.request_read_pkt();
        }
    }

    fn handle_message(&self, msg: ReaderMessage) {
        match msg {
            ReaderMessage::ReadPkt => self.read_once(),
            ReaderMessage::Seek { target_ms, seek_id } => self.seek(target_ms, seek_id),
        }
    }

    /// 队列是否"足够满"：总字节超限，或每条活跃流都已攒够（或已结束）
    fn queues_full(&self, session: &ReaderSession) -> bool {
        let total_bytes: usize = self.queues().map(|(_, q)| q.total_bytes()).sum();
        if total_bytes > self.limits.max_bytes {
            return true;
        }
        self.queues().all(|(kind, queue)| {
            session.eof_sent(kind)
                || (kind == MediaKind::Video && self.video_is_attachment)
                || (queue.readable_len() > self.limits.min_packets
                    && queue.total_duration() > self.limits.min_duration_ms)
        })
    }

    fn has_room(&self, session: &ReaderSession) -> bool {
        !self.queues_full(session)
            && self
                .queues()
                .all(|(kind, queue)| session.eof_sent(kind) || queue.has_writable())
    }

    fn read_once(&self) {
        let mut session = self.session.lock();
        if self.state() != ReaderState::Ready {
            return;
        }

        // ========== 步骤1: 先送出上一轮留在后端的包 ==========
        if let Some(pending) = session.pending_delivery.take() {
            if !self.deliver(&mut session, pending.kind, pending.attachment) {
                self.park_for_delivery(pending.kind);
                return;
            }
            drop(session);
            self.request_read_pkt();
            return;
        }

        // ========== 步骤2: 背压检查 ==========
        if !self.has_room(&session) {
            if !self.transition(ReaderState::Ready, ReaderState::WaitingWritableBuffer) {
                return;
            }
            // 归还通知可能已在切换状态前到达，复查一次
            if !self.has_room(&session) {
                debug!("{} ⏸ 数据包队列已满，等待解码器消费", log_ctx());
                return;
            }
            if !self.transition(ReaderState::WaitingWritableBuffer, ReaderState::Ready) {
                return;
            }
        }

        // ========== 步骤3: 读包并分发 ==========
        match self.backend.read_packet() {
            ReadPacketResult::Video => {
                session.video_packets += 1;
                if !self.deliver(&mut session, MediaKind::Video, false) {
                    self.park_for_delivery(MediaKind::Video);
                    return;
                }
            }
            ReadPacketResult::VideoAttachment => {
                info!("{} 🖼️ 读取到封面图", log_ctx());
                session.video_packets += 1;
                if !self.deliver(&mut session, MediaKind::Video, true) {
                    self.park_for_delivery(MediaKind::Video);
                    return;
                }
            }
            ReadPacketResult::Audio => {
                session.audio_packets += 1;
                if !self.deliver(&mut session, MediaKind::Audio, false) {
                    self.park_for_delivery(MediaKind::Audio);
                    return;
                }
            }
            ReadPacketResult::Subtitle => {
                session.subtitle_packets += 1;
                let mut packet = Packet::default();
                if self.backend.move_packet_into(&mut packet) {
                    if let Some(sink) = &self.subtitle_sink {
                        sink.on_subtitle_packet(&packet);
                    }
                }
            }
            ReadPacketResult::Eof => {
                info!("{} 📄 读包到达文件末尾", log_ctx());
                for kind in [MediaKind::Video, MediaKind::Audio] {
                    if self.queue_for(kind).is_some() && !session.eof_sent(kind) {
                        self.push_eof(&mut session, kind);
                    }
                }
                self.transition(ReaderState::Ready, ReaderState::Eof);
                return;
            }
            ReadPacketResult::Fail => {
                session.read_failures += 1;
                if session.read_failures <= 5 || session.read_failures % 100 == 0 {
                    warn!("{} ⚠️ 读包失败（第 {} 次），重试", log_ctx(), session.read_failures);
                }
            }
            ReadPacketResult::Unknown => {
                self.backend.discard_packet();
            }
        }

        let total = session.video_packets + session.audio_packets;
        if total <= 5 || total % 500 == 0 {
            debug!(
                "{} 📦 已读取 {} 个包（视频 {}，音频 {}）",
                log_ctx(),
                total,
                session.video_packets,
                session.audio_packets
            );
        }
        drop(session);
        self.request_read_pkt();
    }

    /// 把后端刚读到的包放进对应队列；流不活跃或已结束时丢弃
    ///
    /// 队列没有可写缓冲时包留在后端、记入 `pending_delivery`，返回 false。
    /// `attachment` 为 true 时送出后紧跟 EOF 标记（封面只有一个包）。
    fn deliver(&self, session: &mut ReaderSession, kind: MediaKind, attachment: bool) -> bool {
        let Some(queue) = self.queue_for(kind) else {
            self.backend.discard_packet();
            return true;
        };
        if session.eof_sent(kind) {
            self.backend.discard_packet();
            return true;
        }
        let Some(mut buffer) = queue.dequeue_writable() else {
            session.pending_delivery = Some(PendingDelivery { kind, attachment });
            return false;
        };
        if self.backend.move_packet_into(&mut buffer) {
            queue.enqueue_readable(buffer);
        } else {
            queue.enqueue_writable(buffer);
        }
        if attachment {
            self.push_eof(session, kind);
        }
        true
    }

    /// 等 `kind` 队列归还缓冲；归还通知可能已在切换状态前到达，复查一次
    fn park_for_delivery(&self, kind: MediaKind) {
        if !self.transition(ReaderState::Ready, ReaderState::WaitingWritableBuffer) {
            return;
        }
        if self.queue_for(kind).map_or(false, |queue| !queue.has_writable()) {
            debug!("{} ⏸ {} 数据包队列没有可写缓冲，包暂留后端", log_ctx(), kind);
            return;
        }
        if self.transition(ReaderState::WaitingWritableBuffer, ReaderState::Ready) {
            self.request_read_pkt();
        }
    }

    fn push_eof(&self, session: &mut ReaderSession, kind: MediaKind) {
        let Some(queue) = self.queue_for(kind) else {
            return;
        };
        let Some(mut buffer) = queue.dequeue_writable_force() else {
            return;
        };
        buffer.reset();
        buffer.set_eof(true);
        queue.enqueue_readable(buffer);
        session.mark_eof_sent(kind);
        debug!("{} 🔚 {} 队列已推入 EOF 标记", log_ctx(), kind);
    }

    fn seek(&self, target_ms: i64, seek_id: u64) {
        let mut session = self.session.lock();
        if self.state() == ReaderState::Released {
            return;
        }

        let success = match self.backend.seek(target_ms) {
            Ok(()) => {
                for (_, queue) in self.queues() {
                    queue.flush_readable_buffer();
                }
                session.video_eof_sent = false;
                session.audio_eof_sent = false;
                // 后端 seek 时已丢弃暂留的包
                session.pending_delivery = None;
                if let Some(sink) = &self.subtitle_sink {
                    sink.on_flush();
                }
                info!("{} 🧹 Seek 成功: {}ms，数据包队列已冲刷", log_ctx(), target_ms);
                true
            }
            Err(e) => {
                warn!("{} ❌ Seek 失败: {}", log_ctx(), e);
                false
            }
        };

        let serial = self.queues().map(|(_, q)| q.serial()).max().unwrap_or(0);
        self.events.seek_finished(seek_id, target_ms, success, serial);

        {
            let mut state = self.state.lock();
            if *state != ReaderState::Released {
                *state = ReaderState::Ready;
            }
        }
        drop(session);
        self.request_read_pkt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::buffer_queue::{BufferQueue, QueueCapacity};
    use crate::player::events::PlayerEvent;
    use crate::player::synthetic::SyntheticBackend;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::{Duration, Instant};

    struct Fixture {
        reader: Arc<PacketReader>,
        video: Arc<PacketQueue>,
        audio: Arc<PacketQueue>,
        events: Receiver<PlayerEvent>,
    }

    fn fixture(source: &str, config: &PlayerConfig) -> Fixture {
        let backend: Arc<dyn MediaBackend> = Arc::new(SyntheticBackend::default());
        let info = backend.prepare(source).unwrap();
        let video: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("video-packets", QueueCapacity::Unbounded));
        let audio: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("audio-packets", QueueCapacity::Unbounded));
        let (tx, rx) = unbounded();
        let events = PipelineEvents::new(1, Arc::new(move |ev| {
            let _ = tx.send(ev);
        }));
        let attachment = info.video.as_ref().map_or(false, |v| v.is_attachment);
        let reader = PacketReader::new(
            backend,
            Some(video.clone()),
            Some(audio.clone()),
            attachment,
            None,
            events,
            config,
        )
        .unwrap();
        Fixture {
            reader,
            video,
            audio,
            events: rx,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_reads_until_eof_with_markers() {
        let f = fixture("synthetic:duration=400", &PlayerConfig::default());
        f.reader.start();
        assert!(wait_for(|| f.reader.state() == ReaderState::Eof));

        // 10 个包 + 1 个 EOF 标记
        assert_eq!(f.video.readable_len(), 11);
        assert_eq!(f.audio.readable_len(), 11);
        let mut last = None;
        while let Some(p) = f.video.dequeue_readable() {
            last = Some((p.is_eof, p.serial));
            f.video.enqueue_writable(p);
        }
        assert_eq!(last, Some((true, 0)));
        f.reader.release();
    }

    #[test]
    fn test_backpressure_waits_for_writable() {
        let config = PlayerConfig {
            min_queue_packets: 3,
            min_queue_duration_ms: 100,
            ..PlayerConfig::default()
        };
        let f = fixture("synthetic:duration=10000", &config);
        f.reader.start();
        assert!(wait_for(|| f.reader.state() == ReaderState::WaitingWritableBuffer));
        let buffered = f.video.readable_len();
        assert!(buffered >= 4 && buffered < 10, "buffered {}", buffered);

        // 消费后恢复读包
        while let Some(p) = f.video.dequeue_readable() {
            f.video.enqueue_writable(p);
        }
        while let Some(p) = f.audio.dequeue_readable() {
            f.audio.enqueue_writable(p);
        }
        assert!(wait_for(|| f.video.readable_len() >= 4));
        f.reader.release();
    }

    #[test]
    fn test_seek_flushes_and_reports() {
        let config = PlayerConfig {
            min_queue_packets: 1000,
            ..PlayerConfig::default()
        };
        let f = fixture("synthetic:duration=2000", &config);
        f.reader.start();
        assert!(wait_for(|| f.reader.state() == ReaderState::Eof));

        f.reader.request_seek(1500, 7);
        let event = f.events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            event,
            PlayerEvent::SeekFinished {
                generation: 1,
                seek_id: 7,
                target_ms: 1500,
                success: true,
                serial: 1
            }
        );
        assert!(wait_for(|| f.reader.state() == ReaderState::Eof));
        let first = f.video.peek_readable(|p| (p.pts, p.serial)).unwrap();
        assert_eq!(first, (1480, 1));
        f.reader.release();
    }

    #[test]
    fn test_failed_seek_keeps_queues() {
        let f = fixture("synthetic:duration=400,fail_seek=1", &PlayerConfig::default());
        f.reader.start();
        assert!(wait_for(|| f.reader.state() == ReaderState::Eof));
        let before = f.video.readable_len();

        f.reader.request_seek(100, 1);
        match f.events.recv_timeout(Duration::from_secs(1)).unwrap() {
            PlayerEvent::SeekFinished { success, serial, .. } => {
                assert!(!success);
                assert_eq!(serial, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.video.readable_len(), before);
        f.reader.release();
    }

    #[test]
    fn test_full_queue_keeps_packet_in_backend() {
        let backend: Arc<dyn MediaBackend> = Arc::new(SyntheticBackend::default());
        backend.prepare("synthetic:duration=400,audio=0").unwrap();
        let video: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("video-packets", QueueCapacity::Fixed(1)));
        let events = PipelineEvents::new(1, Arc::new(|_: PlayerEvent| {}));
        let reader = PacketReader::new(
            backend.clone(),
            Some(video.clone()),
            None,
            false,
            None,
            events,
            &PlayerConfig::default(),
        )
        .unwrap();

        // 唯一的缓冲被占用
        let held = video.dequeue_writable().unwrap();
        assert_eq!(backend.read_packet(), ReadPacketResult::Video);
        {
            let mut session = reader.session.lock();
            assert!(!reader.deliver(&mut session, MediaKind::Video, false));
            assert_eq!(
                session.pending_delivery,
                Some(PendingDelivery {
                    kind: MediaKind::Video,
                    attachment: false
                })
            );
        }
        assert_eq!(video.allocated(), 1);
        assert_eq!(video.forced_allocations(), 0);

        // 归还后暂留的包被送出
        video.enqueue_writable(held);
        {
            let mut session = reader.session.lock();
            assert!(reader.deliver(&mut session, MediaKind::Video, false));
        }
        assert_eq!(video.peek_readable(|p| p.pts), Some(0));
        assert_eq!(video.forced_allocations(), 0);
        reader.release();
    }

    #[test]
    fn test_cover_art_ends_video_stream() {
        let f = fixture("synthetic:duration=300,cover=1", &PlayerConfig::default());
        f.reader.start();
        assert!(wait_for(|| f.reader.state() == ReaderState::Eof));
        // 封面包 + EOF 标记
        assert_eq!(f.video.readable_len(), 2);
        assert_eq!(f.video.peek_readable_at(1, |p| p.is_eof), Some(true));
        f.reader.release();
    }
}
