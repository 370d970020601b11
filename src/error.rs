use std::path::PathBuf;

/// 人流统计流程中的错误分类
#[derive(Debug, thiserror::Error)]
pub enum PeopleFlowError {
    /// 源视频无法打开或格式不支持
    #[error("视频格式不支持: {path}: {reason}")]
    VideoOpen { path: PathBuf, reason: String },

    /// 主编码和备用编码都无法创建输出
    #[error("无法创建输出视频: {path}: {reason}")]
    OutputOpen { path: PathBuf, reason: String },

    /// 逐帧检测/跟踪过程中失败
    #[error("处理过程中出错: {0}")]
    Processing(String),

    /// 单帧推理失败
    #[error("推理失败: {0}")]
    Inference(String),

    /// 上传的图像无法解码
    #[error("图像解码失败: {0}")]
    Decode(String),

    /// 等待推理令牌超时
    #[error("等待推理资源超时（{waited_ms}ms）")]
    GateTimeout { waited_ms: u64 },

    #[error("写入报告失败: {0}")]
    Report(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PeopleFlowError> = std::result::Result<T, E>;
