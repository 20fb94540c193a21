//! 连接状态机
//!
//! 单条对等连接的生命周期状态。状态值只由拥有它的引擎/Facade 修改，
//! 其他任务通过快照读取（可能落后一次转换，但不会读到撕裂值）。
//!
//! 转换不变量（单次连接尝试内单调）:
//! `NoConnection → Requesting → Active → Handshake → Transferring* → Handshake
//! → ... → NoConnection`，任何错误直接回落到 `NoConnection`。

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::conn::observer::ObserverRegistry;

/// 握手完成后的双端身份信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub remote_device_name: String,
}

/// 文件传输进度
///
/// `speed` 为字节/秒，在 1 秒采样窗口上做指数加权平滑（见 transfer 模块）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// 整数百分比 0..=100
    pub progress: u32,
    /// 平滑后的速率，字节/秒
    pub speed: u64,
    pub total_size: u64,
    pub transferred_size: u64,
}

/// 连接状态，同一时刻每个引擎实例只有一个活跃值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// 初始态，也是任何错误/关闭后的终止复位态
    NoConnection,
    /// connect/bind 尝试进行中
    Requesting,
    /// TCP 已建立，握手尚未完成
    Active {
        local_address: SocketAddr,
        remote_address: SocketAddr,
    },
    /// 握手协议完成，双方已知对端身份，可以发起传输
    Handshake(HandshakeInfo),
    /// 文件传输进行中
    Transferring(TransferProgress),
    /// 平台操作失败（仅 Facade 层发布，引擎自身的失败总是落到 NoConnection）
    Error { message: String },
}

impl ConnectionState {
    /// 握手信息（`Handshake` 状态时可用）
    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        match self {
            ConnectionState::Handshake(info) => Some(info),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::NoConnection => write!(f, "NoConnection"),
            ConnectionState::Requesting => write!(f, "Requesting"),
            ConnectionState::Active { remote_address, .. } => {
                write!(f, "Active({remote_address})")
            }
            ConnectionState::Handshake(info) => {
                write!(f, "Handshake({})", info.remote_device_name)
            }
            ConnectionState::Transferring(p) => {
                write!(f, "Transferring({}%, {} B/s)", p.progress, p.speed)
            }
            ConnectionState::Error { message } => write!(f, "Error({message})"),
        }
    }
}

/// 当前状态单元
///
/// 只有与当前值不同的新状态才会被发布，值相等的重复状态被抑制，
/// 避免唤醒订阅者做无用功。扇出在执行转换的任务上同步进行，
/// 并持有转换锁，保证所有订阅者观察到的转换顺序与应用顺序一致。
/// 观察者回调不得阻塞，也不得重入发布。
pub struct StateCell {
    current: Mutex<ConnectionState>,
    // 转换锁：比较-写入-扇出作为一个整体串行化，保证观察顺序
    transition: Mutex<()>,
    registry: Arc<ObserverRegistry>,
}

impl StateCell {
    pub fn new(registry: Arc<ObserverRegistry>) -> Self {
        Self {
            current: Mutex::new(ConnectionState::NoConnection),
            transition: Mutex::new(()),
            registry,
        }
    }

    /// 快照读取当前状态（扇出期间也可读，可能落后一次转换）
    pub fn current(&self) -> ConnectionState {
        self.current.lock().unwrap().clone()
    }

    /// 发布新状态；与当前值相等时为空操作
    pub fn publish(&self, next: ConnectionState) {
        let _transition = self.transition.lock().unwrap();
        {
            let mut cur = self.current.lock().unwrap();
            if *cur == next {
                return;
            }
            *cur = next.clone();
        }
        self.registry.notify_state(&next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::observer::ConnectionObserver;

    struct Recorder {
        seen: Mutex<Vec<ConnectionState>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<ConnectionState> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ConnectionObserver for Recorder {
        fn on_new_state(&self, state: &ConnectionState) {
            self.seen.lock().unwrap().push(state.clone());
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_duplicate_states_suppressed() {
        let registry = Arc::new(ObserverRegistry::new());
        let cell = StateCell::new(registry.clone());
        let rec = Recorder::new();
        registry.add(rec.clone());

        cell.publish(ConnectionState::Requesting);
        cell.publish(ConnectionState::Requesting);
        cell.publish(ConnectionState::Requesting);

        assert_eq!(rec.seen(), vec![ConnectionState::Requesting]);
        assert_eq!(cell.current(), ConnectionState::Requesting);
    }

    /// 晚订阅者观察到的转换序列必须是早订阅者的后缀
    #[test]
    fn test_late_observer_sees_suffix() {
        let registry = Arc::new(ObserverRegistry::new());
        let cell = StateCell::new(registry.clone());
        let early = Recorder::new();
        registry.add(early.clone());

        cell.publish(ConnectionState::Requesting);
        cell.publish(ConnectionState::Active {
            local_address: addr(1000),
            remote_address: addr(2000),
        });

        let late = Recorder::new();
        registry.add(late.clone());

        let hs = ConnectionState::Handshake(HandshakeInfo {
            local_address: addr(1000),
            remote_address: addr(2000),
            remote_device_name: "peer".to_string(),
        });
        cell.publish(hs.clone());
        cell.publish(ConnectionState::NoConnection);

        let early_seen = early.seen();
        let late_seen = late.seen();
        assert_eq!(late_seen, vec![hs, ConnectionState::NoConnection]);
        assert_eq!(&early_seen[early_seen.len() - late_seen.len()..], &late_seen[..]);

        // 无相邻重复
        for w in early_seen.windows(2) {
            assert_ne!(w[0], w[1]);
        }
    }

    #[test]
    fn test_initial_state_is_no_connection() {
        let cell = StateCell::new(Arc::new(ObserverRegistry::new()));
        assert_eq!(cell.current(), ConnectionState::NoConnection);
    }
}
