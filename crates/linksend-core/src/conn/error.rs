//! 连接层错误类型

use thiserror::Error;

/// P2P 连接错误
///
/// 所有套接字/协议错误都由引擎本地消化为 `NoConnection` 状态转换，
/// 调用方只会通过状态机或等待操作的失败分支观察到它们。
#[derive(Debug, Clone, Error)]
pub enum ConnError {
    /// 监听套接字建立失败（地址被占用、无效地址等）
    #[error("bind failed: {0}")]
    Bind(String),

    /// 连接建立失败（超时、被拒绝）
    #[error("connect failed: {0}")]
    Connect(String),

    /// 握手/关闭/传输期间收到格式错误或非预期的消息
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 文件流传输中途的 I/O 失败，不支持断点续传
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// 同一引擎实例上已有冲突操作在进行中
    #[error("another operation is already in flight")]
    Busy,

    /// 连接已关闭
    #[error("connection closed")]
    Closed,

    /// 平台发现/组管理操作失败（Facade 层）
    #[error("platform action failed: {0}")]
    Action(String),
}
