//! 本地连接 Facade
//!
//! 把平台发现/组管理协作方与连接引擎组合起来，向 UI 暴露两条可观察流
//! （可用设备列表、连接状态）。

pub mod connector;
pub mod platform;

pub use connector::{LocalConnector, P2pLocalConnector};
pub use platform::{ActionError, GroupInfo, P2pPlatform, PlatformEvent};

/// 已发现的对端设备
///
/// 不可变值类型，按字段判等。由发现协作方产出。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub address: String,
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}
