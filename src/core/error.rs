use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开文件: {0}")]
    OpenError(String),

    #[error("没有可播放的音视频流: {0}")]
    NoPlayableStream(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("Seek 失败: {0}")]
    SeekError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("非法状态: 当前 {state} 不允许 {op}")]
    IllegalState { op: &'static str, state: String },

    #[error("播放器已释放")]
    Released,

    #[error("配置解析错误: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
