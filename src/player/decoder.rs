use crate::core::{AudioFrame, MediaKind, Packet, Result, VideoFrame};
use crate::player::backend::{DecodeResult, MediaBackend};
use crate::player::buffer_queue::{Buffer, BufferItem, BufferQueue, PacketQueue, QueueEvent};
use crate::player::looper::Looper;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 解码目标：把一种帧类型和后端的解码入口对应起来
pub trait DecodeTarget: BufferItem {
    const KIND: MediaKind;

    fn decode(backend: &dyn MediaBackend, packet: Option<&Packet>, frame: &mut Self) -> DecodeResult;

    fn flush_codec(backend: &dyn MediaBackend);
}

impl DecodeTarget for VideoFrame {
    const KIND: MediaKind = MediaKind::Video;

    fn decode(backend: &dyn MediaBackend, packet: Option<&Packet>, frame: &mut Self) -> DecodeResult {
        backend.decode_video(packet, frame)
    }

    fn flush_codec(backend: &dyn MediaBackend) {
        backend.flush_video_codec();
    }
}

impl DecodeTarget for AudioFrame {
    const KIND: MediaKind = MediaKind::Audio;

    fn decode(backend: &dyn MediaBackend, packet: Option<&Packet>, frame: &mut Self) -> DecodeResult {
        backend.decode_audio(packet, frame)
    }

    fn flush_codec(backend: &dyn MediaBackend) {
        backend.flush_audio_codec();
    }
}

/// 解码线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    NotInit,
    Ready,
    /// 帧队列已满，等待渲染端归还
    WaitingWritableFrameBuffer,
    /// 数据包队列为空，等待读包
    WaitingReadablePacketBuffer,
    Eof,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderMessage {
    Decode,
}

#[derive(Default)]
struct DecodeSession {
    /// 上一个送进解码器的包的 serial；变化时 flush 解码器
    last_serial: Option<u64>,
    /// 解码器里还有输出，下一轮不取新包
    skip_next_read: bool,
    /// 排空解码器期间暂存的 EOF 包
    held_eof: Option<Buffer<Packet>>,
    decoded: u64,
    failures: u64,
}

/// 解码阶段（音视频共用一套逻辑）
///
/// 每条 Decode 消息只做一轮 "取包 → 解码 → 出帧"，然后重新投递自己，
/// 这样 seek、释放等命令可以在两轮之间插进来。
pub struct FrameDecoder<F: DecodeTarget> {
    state: Mutex<DecoderState>,
    session: Mutex<DecodeSession>,
    backend: Arc<dyn MediaBackend>,
    packet_queue: Arc<PacketQueue>,
    frame_queue: Arc<BufferQueue<F>>,
    looper: Looper<DecoderMessage>,
}

pub type VideoFrameDecoder = FrameDecoder<VideoFrame>;
pub type AudioFrameDecoder = FrameDecoder<AudioFrame>;

impl<F: DecodeTarget> FrameDecoder<F> {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        packet_queue: Arc<PacketQueue>,
        frame_queue: Arc<BufferQueue<F>>,
    ) -> Result<Arc<Self>> {
        let (looper, mailbox) = Looper::new(format!("{}-decoder", F::KIND));
        let decoder = Arc::new(Self {
            state: Mutex::new(DecoderState::NotInit),
            session: Mutex::new(DecodeSession::default()),
            backend,
            packet_queue,
            frame_queue,
            looper,
        });

        let weak = Arc::downgrade(&decoder);
        decoder.looper.spawn(mailbox, move |DecoderMessage::Decode| {
            if let Some(decoder) = weak.upgrade() {
                decoder.decode_once();
            }
        })?;

        // 新包到达：从等待包或 EOF 中恢复
        let weak = Arc::downgrade(&decoder);
        decoder.packet_queue.add_listener(Arc::new(move |event| {
            if event == QueueEvent::NewReadable {
                if let Some(decoder) = weak.upgrade() {
                    decoder.wake_from(&[DecoderState::WaitingReadablePacketBuffer, DecoderState::Eof]);
                }
            }
        }));

        // 帧缓冲归还：从等待帧缓冲中恢复
        let weak = Arc::downgrade(&decoder);
        decoder.frame_queue.add_listener(Arc::new(move |event| {
            if event == QueueEvent::NewWritable {
                if let Some(decoder) = weak.upgrade() {
                    decoder.wake_from(&[DecoderState::WaitingWritableFrameBuffer]);
                }
            }
        }));

        Ok(decoder)
    }

    pub fn state(&self) -> DecoderState {
        *self.state.lock()
    }

    fn transition(&self, from: DecoderState, to: DecoderState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn wake_from(&self, waiting: &[DecoderState]) {
        let woke = {
            let mut state = self.state.lock();
            if waiting.contains(&*state) {
                *state = DecoderState::Ready;
                true
            } else {
                false
            }
        };
        if woke {
            self.request_decode();
        }
    }

    /// 进入等待状态后复查；条件已解除时恢复 Ready 并重新投递
    fn park(&self, waiting: DecoderState, still_blocked: impl Fn() -> bool) {
        if !self.transition(DecoderState::Ready, waiting) || still_blocked() {
            return;
        }
        if self.transition(waiting, DecoderState::Ready) {
            self.request_decode();
        }
    }

    pub fn request_decode(&self) {
        self.looper.post_replacing(DecoderMessage::Decode);
    }

    pub fn start(&self) {
        if self.transition(DecoderState::NotInit, DecoderState::Ready) {
            info!("{} 🎬 {} 解码线程启动", log_ctx(), F::KIND);
            self.request_decode();
        }
    }

    /// 停止解码线程；返回后不会再调用后端，手里的包也已归还
    pub fn release(&self) {
        *self.state.lock() = DecoderState::Released;
        self.looper.quit();
        let mut session = self.session.lock();
        if let Some(packet) = session.held_eof.take() {
            self.packet_queue.enqueue_writable(packet);
        }
        info!(
            "{} 🛑 {} 解码线程退出（解码 {} 帧，失败 {} 次）",
            log_ctx(),
            F::KIND,
            session.decoded,
            session.failures
        );
    }

    fn decode_once(&self) {
        let mut session = self.session.lock();
        if self.state() != DecoderState::Ready {
            return;
        }

        // ========== 步骤1: 确认有包可取（解码器排空时不需要） ==========
        let holding_eof = session.held_eof.is_some();
        let need_packet = !session.skip_next_read && !holding_eof;
        if need_packet && self.packet_queue.readable_len() == 0 {
            self.park(DecoderState::WaitingReadablePacketBuffer, || {
                self.packet_queue.readable_len() == 0
            });
            return;
        }

        // ========== 步骤2: 拿一个可写帧缓冲 ==========
        let Some(mut frame) = self.frame_queue.dequeue_writable() else {
            self.park(DecoderState::WaitingWritableFrameBuffer, || {
                !self.frame_queue.has_writable()
            });
            return;
        };

        let packet = if holding_eof {
            session.held_eof.take()
        } else if need_packet {
            match self.packet_queue.dequeue_readable() {
                Some(packet) => Some(packet),
                None => {
                    self.frame_queue.enqueue_writable(frame);
                    drop(session);
                    self.request_decode();
                    return;
                }
            }
        } else {
            None
        };

        // ========== 步骤3: serial 检查、EOF 标记 ==========
        if let Some(packet) = &packet {
            if session.last_serial != Some(packet.serial) {
                if session.last_serial.is_some() {
                    debug!(
                        "{} 🔄 {} serial {:?} → {}，flush 解码器",
                        log_ctx(),
                        F::KIND,
                        session.last_serial,
                        packet.serial
                    );
                }
                F::flush_codec(&*self.backend);
                session.last_serial = Some(packet.serial);
            }
        }
        let stale = packet
            .as_ref()
            .map_or(false, |p| p.serial != self.packet_queue.serial());
        if stale {
            // seek 之前读出的旧包
            self.frame_queue.enqueue_writable(frame);
            if let Some(packet) = packet {
                debug!("{} 🗑️ {} 丢弃过期包 pts={}ms", log_ctx(), F::KIND, packet.pts);
                self.packet_queue.enqueue_writable(packet);
            }
            drop(session);
            self.request_decode();
            return;
        }

        if let Some(eof_serial) = packet.as_ref().filter(|p| p.is_eof).map(|p| p.serial) {
            // 先取出解码器里缓存的帧，取完才出 EOF 帧
            let drained = F::decode(&*self.backend, packet.as_deref(), &mut frame);
            if matches!(drained, DecodeResult::Success | DecodeResult::SuccessAndSkipNextPkt) {
                frame.set_serial(eof_serial);
                session.decoded += 1;
                self.frame_queue.enqueue_readable(frame);
                session.held_eof = packet;
                drop(session);
                self.request_decode();
                return;
            }
            frame.reset();
            frame.set_eof(true);
            frame.set_serial(eof_serial);
            self.frame_queue.enqueue_readable(frame);
            if let Some(packet) = packet {
                self.packet_queue.enqueue_writable(packet);
            }
            session.skip_next_read = false;
            self.transition(DecoderState::Ready, DecoderState::Eof);
            info!("{} 🔚 {} 解码到达 EOF（共 {} 帧）", log_ctx(), F::KIND, session.decoded);
            return;
        }

        // ========== 步骤4: 解码 ==========
        let serial = session.last_serial.unwrap_or(0);
        let result = F::decode(&*self.backend, packet.as_deref(), &mut frame);
        match result {
            DecodeResult::Success | DecodeResult::SuccessAndSkipNextPkt => {
                frame.set_serial(serial);
                session.decoded += 1;
                if session.decoded <= 3 || session.decoded % 500 == 0 {
                    debug!(
                        "{} 🎞️ {} 解码第 {} 帧 pts={}ms",
                        log_ctx(),
                        F::KIND,
                        session.decoded,
                        frame.pts()
                    );
                }
                self.frame_queue.enqueue_readable(frame);
                session.skip_next_read = result == DecodeResult::SuccessAndSkipNextPkt;
            }
            DecodeResult::Fail => {
                session.failures += 1;
                warn!(
                    "{} ⚠️ {} 解码失败，丢弃包 pts={:?}ms",
                    log_ctx(),
                    F::KIND,
                    packet.as_ref().map(|p| p.pts)
                );
                self.frame_queue.enqueue_writable(frame);
                session.skip_next_read = false;
            }
            DecodeResult::FailAndNeedMorePkt | DecodeResult::DecodeEnd => {
                self.frame_queue.enqueue_writable(frame);
                session.skip_next_read = false;
            }
        }
        if let Some(packet) = packet {
            self.packet_queue.enqueue_writable(packet);
        }

        drop(session);
        self.request_decode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::buffer_queue::QueueCapacity;
    use crate::player::synthetic::SyntheticBackend;
    use std::time::{Duration, Instant};

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

    fn push_packet(queue: &PacketQueue, backend: &dyn MediaBackend) {
        let mut buf = queue.dequeue_writable_force().unwrap();
        assert!(backend.move_packet_into(&mut buf));
        queue.enqueue_readable(buf);
    }

    fn push_eof(queue: &PacketQueue) {
        let mut buf = queue.dequeue_writable_force().unwrap();
        buf.set_eof(true);
        queue.enqueue_readable(buf);
    }

    #[test]
    fn test_audio_decoder_drains_two_frames_per_packet() {
        let backend: Arc<dyn MediaBackend> = Arc::new(SyntheticBackend::default());
        backend.prepare("synthetic:duration=80,video=0").unwrap();
        let packets: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("audio-packets", QueueCapacity::Unbounded));
        let frames = Arc::new(BufferQueue::<AudioFrame>::new("audio-frames", QueueCapacity::Fixed(8)));

        for _ in 0..2 {
            backend.read_packet();
            push_packet(&packets, &*backend);
        }
        push_eof(&packets);

        let decoder = AudioFrameDecoder::new(backend, packets.clone(), frames.clone()).unwrap();
        decoder.start();
        assert!(wait_for(|| decoder.state() == DecoderState::Eof));

        let mut seen = Vec::new();
        while let Some(f) = frames.dequeue_readable() {
            seen.push((f.pts, f.is_eof));
            frames.enqueue_writable(f);
        }
        assert_eq!(
            seen,
            vec![(0, false), (20, false), (40, false), (60, false), (0, true)]
        );
        assert_eq!(packets.readable_len(), 0);
        decoder.release();
    }

    #[test]
    fn test_waits_for_frame_buffers() {
        let backend: Arc<dyn MediaBackend> = Arc::new(SyntheticBackend::default());
        backend.prepare("synthetic:duration=400,audio=0").unwrap();
        let packets: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("video-packets", QueueCapacity::Unbounded));
        let frames = Arc::new(BufferQueue::<VideoFrame>::new("video-frames", QueueCapacity::Fixed(2)));
        for _ in 0..6 {
            backend.read_packet();
            push_packet(&packets, &*backend);
        }

        let decoder = VideoFrameDecoder::new(backend, packets.clone(), frames.clone()).unwrap();
        decoder.start();
        assert!(wait_for(|| decoder.state() == DecoderState::WaitingWritableFrameBuffer));
        assert_eq!(frames.readable_len(), 2);

        // 归还一帧后继续解码
        let f = frames.dequeue_readable().unwrap();
        assert_eq!(f.pts, 0);
        frames.enqueue_writable(f);
        assert!(wait_for(|| frames.peek_readable_at(1, |f| f.pts) == Some(80)));
        decoder.release();
    }

    #[test]
    fn test_new_serial_after_flush() {
        let backend: Arc<dyn MediaBackend> = Arc::new(SyntheticBackend::default());
        backend.prepare("synthetic:duration=2000,audio=0").unwrap();
        let packets: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("video-packets", QueueCapacity::Unbounded));
        let frames = Arc::new(BufferQueue::<VideoFrame>::new("video-frames", QueueCapacity::Fixed(4)));

        let decoder = VideoFrameDecoder::new(backend.clone(), packets.clone(), frames.clone()).unwrap();
        decoder.start();
        assert!(wait_for(|| decoder.state() == DecoderState::WaitingReadablePacketBuffer));

        // 模拟 seek：冲刷后送入新 serial 的包
        packets.flush_readable_buffer();
        backend.seek(1000).unwrap();
        backend.read_packet();
        push_packet(&packets, &*backend);

        assert!(wait_for(|| frames.readable_len() == 1));
        assert_eq!(frames.peek_readable(|f| (f.pts, f.serial)), Some((1000, 1)));
        decoder.release();
    }

    /// 输出比输入晚一个包的解码器（类似有 B 帧重排的编码）
    #[derive(Default)]
    struct DelayedBackend {
        held: Mutex<Option<i64>>,
    }

    impl MediaBackend for DelayedBackend {
        fn prepare(&self, _: &str) -> Result<crate::core::MediaInfo> {
            Err(crate::core::PlayerError::Other("unused".into()))
        }

        fn read_packet(&self) -> crate::player::backend::ReadPacketResult {
            crate::player::backend::ReadPacketResult::Eof
        }

        fn move_packet_into(&self, _: &mut Packet) -> bool {
            false
        }

        fn seek(&self, _: i64) -> Result<()> {
            Ok(())
        }

        fn decode_video(&self, packet: Option<&Packet>, frame: &mut VideoFrame) -> DecodeResult {
            let Some(packet) = packet else {
                return DecodeResult::FailAndNeedMorePkt;
            };
            let mut held = self.held.lock();
            let out = if packet.is_eof {
                held.take()
            } else {
                held.replace(packet.pts)
            };
            match out {
                Some(pts) => {
                    frame.pts = pts;
                    DecodeResult::Success
                }
                None if packet.is_eof => DecodeResult::DecodeEnd,
                None => DecodeResult::FailAndNeedMorePkt,
            }
        }

        fn decode_audio(&self, _: Option<&Packet>, _: &mut AudioFrame) -> DecodeResult {
            DecodeResult::Fail
        }

        fn flush_video_codec(&self) {
            *self.held.lock() = None;
        }

        fn flush_audio_codec(&self) {}

        fn release(&self) {}

        fn description(&self) -> String {
            "DelayedBackend".to_string()
        }
    }

    #[test]
    fn test_eof_drains_buffered_frames_first() {
        let backend: Arc<dyn MediaBackend> = Arc::new(DelayedBackend::default());
        let packets: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("video-packets", QueueCapacity::Unbounded));
        let frames = Arc::new(BufferQueue::<VideoFrame>::new("video-frames", QueueCapacity::Fixed(8)));
        for pts in [0, 40, 80] {
            let mut buf = packets.dequeue_writable_force().unwrap();
            buf.pts = pts;
            buf.data = vec![1];
            packets.enqueue_readable(buf);
        }
        push_eof(&packets);

        let decoder = VideoFrameDecoder::new(backend, packets.clone(), frames.clone()).unwrap();
        decoder.start();
        assert!(wait_for(|| decoder.state() == DecoderState::Eof));

        let mut seen = Vec::new();
        while let Some(f) = frames.dequeue_readable() {
            seen.push((f.pts, f.is_eof));
            frames.enqueue_writable(f);
        }
        assert_eq!(seen, vec![(0, false), (40, false), (80, false), (0, true)]);
        decoder.release();
    }

    #[test]
    fn test_release_returns_held_eof_packet() {
        let backend: Arc<dyn MediaBackend> = Arc::new(DelayedBackend::default());
        let packets: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("video-packets", QueueCapacity::Unbounded));
        let frames = Arc::new(BufferQueue::<VideoFrame>::new("video-frames", QueueCapacity::Fixed(1)));
        for pts in [0, 40] {
            let mut buf = packets.dequeue_writable_force().unwrap();
            buf.pts = pts;
            buf.data = vec![1];
            packets.enqueue_readable(buf);
        }
        push_eof(&packets);

        let decoder = VideoFrameDecoder::new(backend, packets.clone(), frames.clone()).unwrap();
        decoder.start();
        assert!(wait_for(|| decoder.state() == DecoderState::WaitingWritableFrameBuffer));

        // 归还一帧：EOF 包排空出 40 后被暂存，解码器再次等待帧缓冲
        let f = frames.dequeue_readable().unwrap();
        assert_eq!(f.pts, 0);
        frames.enqueue_writable(f);
        assert!(wait_for(|| {
            frames.peek_readable(|f| f.pts) == Some(40)
                && decoder.state() == DecoderState::WaitingWritableFrameBuffer
        }));
        assert_eq!(packets.readable_len(), 0);
        assert_eq!(packets.in_flight(), 1);

        decoder.release();
        assert_eq!(packets.in_flight(), 0);
        packets.release();
        assert_eq!(packets.allocated(), 0);
    }
}
