//! Linksend Core Library
//!
//! 局域网 WiFi P2P 点对点文件传输的核心实现库。
//!
//! 把推模式、回调驱动的平台组网 API 桥接为一致的异步连接状态机，
//! 并在裸套接字上实现握手/传输协议。
//!
//! # 模块
//!
//! - **conn**: 连接状态机、观察者注册表、线协议、连接引擎
//! - **transfer**: 文件流式收发与进度/速率统计
//! - **local**: 平台协作方契约与本地连接 Facade
//! - **config**: 应用设置持久化
//!
//! # 使用示例
//!
//! ## 监听端（组主）
//!
//! ```ignore
//! use linksend_core::{ConnRole, P2pConnection};
//!
//! let conn = P2pConnection::new(ConnRole::Listener, "my-device", download_dir);
//! let bound = conn.bind("0.0.0.0:8888".parse()?).await?;
//!
//! // 对端接入并完成握手
//! let handshake = conn.wait_handshaking().await?;
//! println!("connected to {}", handshake.remote_device_name);
//!
//! // 等待对端关闭
//! conn.wait_close().await;
//! ```
//!
//! ## 连接端（客户端）
//!
//! ```ignore
//! use linksend_core::{ConnRole, P2pConnection};
//!
//! let conn = P2pConnection::new(ConnRole::Connector, "my-device", download_dir);
//! let handshake = conn.connect("192.168.49.1:8888".parse()?).await?;
//!
//! conn.request_transfer_file(&path).await?;
//! conn.request_close().await?;
//! ```

pub mod config;
pub mod conn;
pub mod local;
pub mod transfer;

// Conn re-exports
pub use conn::{
    CONNECT_TIMEOUT, CONTROL_TIMEOUT, ConnError, ConnRole, ConnectionObserver, ConnectionState,
    HandshakeInfo, ObserverRegistry, P2pConnection, TransferProgress,
};

// Local re-exports
pub use local::{
    ActionError, Device, GroupInfo, LocalConnector, P2pLocalConnector, P2pPlatform, PlatformEvent,
};

// Config re-exports
pub use config::AppSettings;
