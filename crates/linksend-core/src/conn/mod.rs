//! 对等连接核心
//!
//! 单条 P2P 套接字连接的状态机、观察者注册表、线协议与引擎。

pub mod connection;
pub mod error;
mod ext;
pub mod observer;
pub mod protocol;
pub mod state;

pub use connection::{CONNECT_TIMEOUT, CONTROL_TIMEOUT, ConnRole, P2pConnection};
pub use error::ConnError;
pub use observer::{ConnectionObserver, ObserverRegistry};
pub use state::{ConnectionState, HandshakeInfo, StateCell, TransferProgress};
