//! 错误类型定义

use thiserror::Error;

/// 协议错误类型
#[derive(Error, Debug)]
pub enum WireError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// 负载不是合法的十六进制文本
    #[error("Encoding error: {0}")]
    Encoding(#[from] hex::FromHexError),

    /// 帧大小超限
    #[error("Frame too large: more than {max} bytes before delimiter")]
    FrameTooLarge { max: usize },

    /// 分隔符为空
    #[error("Delimiter must not be empty")]
    EmptyDelimiter,

    /// 负载中包含完整分隔符，无法作为单帧发送
    #[error("Payload of {len} bytes contains the frame delimiter")]
    DelimiterInPayload { len: usize },

    /// 命令类型未注册
    #[error("Unregistered command type: {tag}")]
    UnregisteredCommand { tag: String },

    /// 命令内容与声明的类型不符
    #[error("Command declared as {declared} decoded as {actual}")]
    UnexpectedCommand { declared: String, actual: String },

    /// 用户命令处理器失败
    #[error("Command handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// 行数据不是合法 UTF-8
    #[error("Invalid UTF-8 line: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// 监听任务异常退出
    #[error("Listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, WireError>;
