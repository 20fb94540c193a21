//! 本地连接器实现
//!
//! 组合平台协作方与连接引擎：平台广播事件经由一个 per-instance 的顺序
//! 工作器逐个消化（任意线程投递与状态变更解耦），成组后按
//! `is_group_owner` 决定引擎角色并接管套接字层。引擎的状态转换被转发到
//! Facade 的 `watch` 流上，UI 随时可以读取当前值重新同步。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::AppSettings;
use crate::conn::connection::{ConnRole, P2pConnection};
use crate::conn::error::ConnError;
use crate::conn::observer::ConnectionObserver;
use crate::conn::state::ConnectionState;
use crate::local::platform::{GroupInfo, P2pPlatform, PlatformEvent};
use crate::local::Device;

/// Facade 契约：UI 消费的两条可观察流与操作集合
#[async_trait]
pub trait LocalConnector: Send + Sync {
    /// 可用设备列表，整表替换语义，最后一次的值获胜
    fn available_devices(&self) -> watch::Receiver<Vec<Device>>;

    /// 当前连接状态
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// 扫描可用设备并发布到设备流；失败发布空表
    async fn scan_for_available_devices(&self);

    /// 请求与目标设备建立组连接
    async fn request_connection(&self, device: &Device) -> Result<(), ConnError>;

    /// 作为组主断开：关闭引擎连接并解散组
    async fn disconnect_as_host(&self) -> Result<(), ConnError>;

    /// 作为客户端断开：关闭引擎连接并退出组
    async fn disconnect_as_client(&self) -> Result<(), ConnError>;

    /// 向对端传输文件
    async fn transfer_file_request(&self, path: &Path) -> Result<(), ConnError>;

    /// 重新读取组连接信息并重新发布当前状态
    async fn check_connection_state(&self) -> Option<GroupInfo>;
}

struct Shared<P> {
    platform: Arc<P>,
    device_name: String,
    listen_port: u16,
    download_dir: PathBuf,
    devices_tx: watch::Sender<Vec<Device>>,
    state_tx: watch::Sender<ConnectionState>,
    engine: StdMutex<Option<P2pConnection>>,
}

/// 把引擎的状态转换转发到 Facade 的 watch 流
struct StateForwarder {
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionObserver for StateForwarder {
    fn on_new_state(&self, state: &ConnectionState) {
        self.state_tx.send_replace(state.clone());
    }
}

/// WiFi P2P 本地连接器
pub struct P2pLocalConnector<P: P2pPlatform> {
    shared: Arc<Shared<P>>,
    worker: JoinHandle<()>,
}

impl<P: P2pPlatform> P2pLocalConnector<P> {
    /// 构造连接器并启动事件工作器
    ///
    /// 平台协作方是显式传入的依赖；`events` 是平台广播的入站队列。
    pub fn new(
        platform: Arc<P>,
        settings: &AppSettings,
        events: mpsc::UnboundedReceiver<PlatformEvent>,
    ) -> Self {
        let (devices_tx, _) = watch::channel(Vec::new());
        let (state_tx, _) = watch::channel(ConnectionState::NoConnection);
        let shared = Arc::new(Shared {
            platform,
            device_name: settings.device_name.clone(),
            listen_port: settings.listen_port,
            download_dir: settings.download_dir.clone(),
            devices_tx,
            state_tx,
            engine: StdMutex::new(None),
        });

        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            run_worker(worker_shared, events).await;
        });

        Self { shared, worker }
    }

    /// 当前引擎实例（已成组时）
    pub fn engine(&self) -> Option<P2pConnection> {
        self.shared.engine.lock().unwrap().clone()
    }
}

impl<P: P2pPlatform> Drop for P2pLocalConnector<P> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// 顺序事件工作器：所有 Facade 状态变更都在这里逐个应用
async fn run_worker<P: P2pPlatform>(
    shared: Arc<Shared<P>>,
    mut events: mpsc::UnboundedReceiver<PlatformEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PlatformEvent::WifiStateChanged { enabled } => {
                if enabled {
                    debug!("Wifi p2p enabled");
                } else {
                    warn!("Wifi p2p disabled");
                    shared.state_tx.send_replace(ConnectionState::Error {
                        message: "wifi p2p disabled".to_string(),
                    });
                }
            }
            PlatformEvent::PeersChanged => {
                refresh_peers(&shared).await;
            }
            PlatformEvent::ConnectionChanged => {
                debug!("Connection state change");
                sync_connection(&shared).await;
            }
        }
    }
}

async fn refresh_peers<P: P2pPlatform>(shared: &Arc<Shared<P>>) {
    match shared.platform.request_peers().await {
        Ok(devices) => {
            debug!(
                "P2P devices: {}",
                devices
                    .iter()
                    .map(|d| format!("{} -> {}", d.name, d.address))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            shared.devices_tx.send_replace(devices);
        }
        Err(e) => {
            warn!("Request peers failed: {e}");
            shared.devices_tx.send_replace(Vec::new());
        }
    }
}

/// 读取组连接信息并据此装配/拆除引擎
async fn sync_connection<P: P2pPlatform>(shared: &Arc<Shared<P>>) {
    let info = match shared.platform.request_connection_info().await {
        Ok(info) => info,
        Err(e) => {
            warn!("Request connection info failed: {e}");
            shared.state_tx.send_replace(ConnectionState::Error {
                message: e.to_string(),
            });
            return;
        }
    };

    match info {
        None => {
            // 组已不存在，拆除引擎
            let engine = shared.engine.lock().unwrap().take();
            if let Some(engine) = engine {
                let _ = engine.request_close().await;
            }
            shared.state_tx.send_replace(ConnectionState::NoConnection);
        }
        Some(info) => {
            if shared.engine.lock().unwrap().is_some() {
                // 已装配，重复的组变更事件
                return;
            }
            info!(
                "Group formed: owner={}, owner_address={}",
                info.is_group_owner, info.group_owner_address
            );

            let role = if info.is_group_owner {
                ConnRole::Listener
            } else {
                ConnRole::Connector
            };
            let engine = P2pConnection::new(
                role,
                shared.device_name.clone(),
                shared.download_dir.clone(),
            );
            engine.add_observer(Arc::new(StateForwarder {
                state_tx: shared.state_tx.clone(),
            }));
            *shared.engine.lock().unwrap() = Some(engine.clone());

            let addr = SocketAddr::new(info.group_owner_address, shared.listen_port);
            tokio::spawn(async move {
                let result = match role {
                    ConnRole::Listener => engine.bind(addr).await.map(|_| ()),
                    ConnRole::Connector => engine.connect(addr).await.map(|_| ()),
                };
                if let Err(e) = result {
                    // 引擎已经把失败写入状态机，这里只记录
                    warn!("Engine setup failed: {e}");
                }
            });
        }
    }
}

#[async_trait]
impl<P: P2pPlatform> LocalConnector for P2pLocalConnector<P> {
    fn available_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.shared.devices_tx.subscribe()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    async fn scan_for_available_devices(&self) {
        if let Err(e) = self.shared.platform.discover_peers().await {
            warn!("Request discover peers failed: {e}");
            self.shared.devices_tx.send_replace(Vec::new());
            return;
        }
        debug!("Request discover peers success");
        refresh_peers(&self.shared).await;
    }

    async fn request_connection(&self, device: &Device) -> Result<(), ConnError> {
        self.shared
            .state_tx
            .send_replace(ConnectionState::Requesting);
        if let Err(e) = self.shared.platform.connect(device).await {
            warn!("Request P2P connection failed: {e}");
            self.shared
                .state_tx
                .send_replace(ConnectionState::NoConnection);
            return Err(ConnError::Action(e.to_string()));
        }
        info!("Request P2P connection success");
        // 平台事件可能尚未到达，主动同步一次
        sync_connection(&self.shared).await;
        Ok(())
    }

    async fn disconnect_as_host(&self) -> Result<(), ConnError> {
        let engine = self.shared.engine.lock().unwrap().take();
        if let Some(engine) = engine {
            engine.request_close().await?;
        }
        self.shared
            .platform
            .remove_group()
            .await
            .map_err(|e| ConnError::Action(e.to_string()))?;
        self.shared
            .state_tx
            .send_replace(ConnectionState::NoConnection);
        Ok(())
    }

    async fn disconnect_as_client(&self) -> Result<(), ConnError> {
        let engine = self.shared.engine.lock().unwrap().take();
        if let Some(engine) = engine {
            engine.request_close().await?;
        }
        // 客户端退出同样通过移除组实现
        self.shared
            .platform
            .remove_group()
            .await
            .map_err(|e| ConnError::Action(e.to_string()))?;
        self.shared
            .state_tx
            .send_replace(ConnectionState::NoConnection);
        Ok(())
    }

    async fn transfer_file_request(&self, path: &Path) -> Result<(), ConnError> {
        let engine = self.engine().ok_or(ConnError::Closed)?;
        engine.request_transfer_file(path).await
    }

    async fn check_connection_state(&self) -> Option<GroupInfo> {
        match self.shared.platform.request_connection_info().await {
            Ok(info) => {
                let state = match self.engine() {
                    Some(engine) => engine.current_state(),
                    None => ConnectionState::NoConnection,
                };
                self.shared.state_tx.send_replace(state);
                info
            }
            Err(e) => {
                self.shared.state_tx.send_replace(ConnectionState::Error {
                    message: e.to_string(),
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::platform::ActionError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockPlatform {
        peers: StdMutex<Vec<Device>>,
        fail_peers: AtomicBool,
        fail_connect: AtomicBool,
        group: StdMutex<Option<GroupInfo>>,
        removed: AtomicUsize,
    }

    impl MockPlatform {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                peers: StdMutex::new(Vec::new()),
                fail_peers: AtomicBool::new(false),
                fail_connect: AtomicBool::new(false),
                group: StdMutex::new(None),
                removed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl P2pPlatform for MockPlatform {
        async fn discover_peers(&self) -> Result<(), ActionError> {
            Ok(())
        }

        async fn request_peers(&self) -> Result<Vec<Device>, ActionError> {
            if self.fail_peers.load(Ordering::SeqCst) {
                return Err(ActionError("busy".to_string()));
            }
            Ok(self.peers.lock().unwrap().clone())
        }

        async fn connect(&self, _device: &Device) -> Result<(), ActionError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ActionError("connect rejected".to_string()));
            }
            Ok(())
        }

        async fn request_connection_info(&self) -> Result<Option<GroupInfo>, ActionError> {
            Ok(self.group.lock().unwrap().clone())
        }

        async fn remove_group(&self) -> Result<(), ActionError> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            *self.group.lock().unwrap() = None;
            Ok(())
        }
    }

    fn test_settings() -> AppSettings {
        AppSettings {
            device_name: "facade-test".to_string(),
            listen_port: 0,
            download_dir: std::env::temp_dir(),
            verbose: false,
        }
    }

    #[tokio::test]
    async fn test_scan_publishes_devices() {
        let platform = MockPlatform::new();
        *platform.peers.lock().unwrap() = vec![
            Device::new("phone-a", "aa:bb:cc:dd:ee:01"),
            Device::new("phone-b", "aa:bb:cc:dd:ee:02"),
        ];
        let (_tx, rx) = mpsc::unbounded_channel();
        let connector = P2pLocalConnector::new(platform, &test_settings(), rx);

        connector.scan_for_available_devices().await;

        let devices = connector.available_devices().borrow().clone();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "phone-a");
    }

    /// 拉取对端失败时发布空表
    #[tokio::test]
    async fn test_scan_failure_publishes_empty_list() {
        let platform = MockPlatform::new();
        *platform.peers.lock().unwrap() = vec![Device::new("phone-a", "aa:bb:cc:dd:ee:01")];
        let (_tx, rx) = mpsc::unbounded_channel();
        let connector = P2pLocalConnector::new(platform.clone(), &test_settings(), rx);

        connector.scan_for_available_devices().await;
        assert_eq!(connector.available_devices().borrow().len(), 1);

        platform.fail_peers.store(true, Ordering::SeqCst);
        connector.scan_for_available_devices().await;
        assert!(connector.available_devices().borrow().is_empty());
    }

    /// 平台 connect 失败映射为 Action 错误并回落 NoConnection
    #[tokio::test]
    async fn test_request_connection_failure() {
        let platform = MockPlatform::new();
        platform.fail_connect.store(true, Ordering::SeqCst);
        let (_tx, rx) = mpsc::unbounded_channel();
        let connector = P2pLocalConnector::new(platform, &test_settings(), rx);

        let device = Device::new("phone-a", "aa:bb:cc:dd:ee:01");
        let err = connector.request_connection(&device).await;
        assert!(matches!(err, Err(ConnError::Action(_))));
        assert_eq!(
            *connector.connection_state().borrow(),
            ConnectionState::NoConnection
        );
    }

    /// 成组（组主侧）后引擎被装配并开始监听
    #[tokio::test]
    async fn test_group_formation_creates_listener_engine() {
        let platform = MockPlatform::new();
        *platform.group.lock().unwrap() = Some(GroupInfo {
            is_group_owner: true,
            group_owner_address: "127.0.0.1".parse().unwrap(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = P2pLocalConnector::new(platform, &test_settings(), rx);

        tx.send(PlatformEvent::ConnectionChanged).unwrap();

        // 等待顺序工作器消化事件
        for _ in 0..50 {
            if connector.engine().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let engine = connector.engine().expect("engine must be installed");
        assert_eq!(engine.role(), ConnRole::Listener);
    }

    /// 组解散后引擎被拆除，断开时调用 remove_group
    #[tokio::test]
    async fn test_disconnect_removes_group() {
        let platform = MockPlatform::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        let connector = P2pLocalConnector::new(platform.clone(), &test_settings(), rx);

        connector.disconnect_as_host().await.unwrap();
        assert_eq!(platform.removed.load(Ordering::SeqCst), 1);
        assert_eq!(
            *connector.connection_state().borrow(),
            ConnectionState::NoConnection
        );
    }

    /// 平台 connection info 失败映射为 Error 状态
    #[tokio::test]
    async fn test_check_connection_state_error_maps_to_error_state() {
        struct FailingPlatform;

        #[async_trait]
        impl P2pPlatform for FailingPlatform {
            async fn discover_peers(&self) -> Result<(), ActionError> {
                Ok(())
            }
            async fn request_peers(&self) -> Result<Vec<Device>, ActionError> {
                Ok(Vec::new())
            }
            async fn connect(&self, _device: &Device) -> Result<(), ActionError> {
                Ok(())
            }
            async fn request_connection_info(&self) -> Result<Option<GroupInfo>, ActionError> {
                Err(ActionError("p2p unsupported".to_string()))
            }
            async fn remove_group(&self) -> Result<(), ActionError> {
                Ok(())
            }
        }

        let (_tx, rx) = mpsc::unbounded_channel();
        let connector = P2pLocalConnector::new(Arc::new(FailingPlatform), &test_settings(), rx);

        let info = connector.check_connection_state().await;
        assert!(info.is_none());
        assert!(matches!(
            *connector.connection_state().borrow(),
            ConnectionState::Error { .. }
        ));
    }
}
