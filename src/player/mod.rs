// 播放管线：读包 → 解码 → 同步渲染

pub mod looper;
pub mod buffer_queue;
pub mod backend;
pub mod events;
pub mod sink;
pub mod sync;
pub mod synthetic;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_backend;
pub mod audio_output;
pub mod packet_reader;
pub mod decoder;
pub mod video_renderer;
pub mod audio_renderer;
pub mod manager;

pub use backend::{BackendFactory, DecodeResult, MediaBackend, ReadPacketResult};
pub use buffer_queue::{Buffer, BufferItem, BufferQueue, FrameLease, QueueCapacity, QueueEvent};
pub use sink::{AudioOutput, AudioOutputFactory, NullVideoSink, SubtitleSink, VideoSink};
pub use synthetic::{SyntheticBackend, SyntheticMedia};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_backend::FfmpegBackend;
pub use audio_output::SimulatedAudioOutput;
#[cfg(feature = "cpal")]
pub use audio_output::CpalAudioOutput;
pub use manager::{Collaborators, Player, PlayerListener};
