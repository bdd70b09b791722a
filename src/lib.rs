//! 本地文件音视频播放引擎
//!
//! 读包、音视频解码、音视频渲染各跑在一个独立的消息线程上，
//! 阶段之间只通过 [`player::BufferQueue`] 交换数据；`serial` 用来识别 seek 之前的过期数据。
//! 真正的解封装/解码和输出设备都是外部协作者（[`player::MediaBackend`]、
//! [`player::VideoSink`]、[`player::AudioOutput`]）。

pub mod core;
pub mod player;

pub use crate::core::{MediaInfo, PlayerConfig, PlayerError, PlayerState, Result};
pub use crate::player::{Collaborators, Player, PlayerListener};
