//! 平台发现/组管理协作方契约
//!
//! 无线电管理、权限、系统广播都在本仓库之外；Facade 只通过这个 trait
//! 消费它们。广播事件可能在任意线程上投递，而且相对方法调用的完成
//! 没有顺序保证——Facade 在自己的顺序工作器上逐个消化。

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::local::Device;

/// 平台操作失败
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ActionError(pub String);

/// 组建立后的本地连接信息
///
/// `is_group_owner` 决定引擎角色：组主作监听方，另一端作连接方。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub is_group_owner: bool,
    pub group_owner_address: IpAddr,
}

/// 平台广播事件，每个真实平台事件至多投递一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    /// 无线电开关状态变化
    WifiStateChanged { enabled: bool },
    /// 对端列表有更新，需要重新拉取
    PeersChanged,
    /// 组连接建立或断开
    ConnectionChanged,
}

/// 平台协作方操作
#[async_trait]
pub trait P2pPlatform: Send + Sync + 'static {
    /// 发起一轮对端发现
    async fn discover_peers(&self) -> Result<(), ActionError>;

    /// 当前已发现的对端列表
    async fn request_peers(&self) -> Result<Vec<Device>, ActionError>;

    /// 请求与目标设备组网
    async fn connect(&self, device: &Device) -> Result<(), ActionError>;

    /// 当前组连接信息；尚未成组时为 `None`
    async fn request_connection_info(&self) -> Result<Option<GroupInfo>, ActionError>;

    /// 解散/退出当前组
    async fn remove_group(&self) -> Result<(), ActionError>;
}
