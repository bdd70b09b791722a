use crate::core::{MediaKind, PlayerState};
use std::sync::Arc;

/// 管线工作线程上报给播放器事件线程的消息
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    SeekFinished {
        generation: u64,
        seek_id: u64,
        target_ms: i64,
        success: bool,
        serial: u64,
    },
    RendererEof {
        generation: u64,
        kind: MediaKind,
        serial: u64,
    },
    FrameRendered {
        generation: u64,
        kind: MediaKind,
        pts: i64,
        serial: u64,
    },
    NotifyState(PlayerState),
}

pub type EventSink = Arc<dyn Fn(PlayerEvent) + Send + Sync>;

/// 带管线代次的事件投递端
///
/// 每次 prepare 生成新的代次，旧管线迟到的事件由播放器丢弃。
#[derive(Clone)]
pub struct PipelineEvents {
    generation: u64,
    sink: EventSink,
}

impl PipelineEvents {
    pub fn new(generation: u64, sink: EventSink) -> Self {
        Self { generation, sink }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn seek_finished(&self, seek_id: u64, target_ms: i64, success: bool, serial: u64) {
        (self.sink)(PlayerEvent::SeekFinished {
            generation: self.generation,
            seek_id,
            target_ms,
            success,
            serial,
        });
    }

    pub fn renderer_eof(&self, kind: MediaKind, serial: u64) {
        (self.sink)(PlayerEvent::RendererEof {
            generation: self.generation,
            kind,
            serial,
        });
    }

    pub fn frame_rendered(&self, kind: MediaKind, pts: i64, serial: u64) {
        (self.sink)(PlayerEvent::FrameRendered {
            generation: self.generation,
            kind,
            pts,
            serial,
        });
    }
}
