//! 引擎操作的可等待适配层
//!
//! 把"订阅状态机、等待第一个匹配状态"的回调模式桥接为可取消的等待。
//! 每个等待注册一个一次性观察者并恰好解析一次——要么成功值，要么携带
//! 错误的失败；首次解析获胜，之后的回调触发被静默忽略（不是崩溃）。
//!
//! 取消契约：等待被取消（future 被丢弃）时，守卫把观察者从注册表移除，
//! 不留下悬挂订阅，也不会去打断底层套接字操作。实际发生了什么，
//! 以引擎自身的状态机为唯一事实来源。

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::conn::connection::P2pConnection;
use crate::conn::error::ConnError;
use crate::conn::observer::{ConnectionObserver, ObserverRegistry};
use crate::conn::state::{ConnectionState, HandshakeInfo};

/// 一次性完成单元：首次完成获胜，后续尝试为空操作
struct OneShotCell<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> OneShotCell<T> {
    fn new(tx: oneshot::Sender<T>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn complete(&self, value: T) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            // 接收端已被丢弃（等待被取消）时静默忽略
            let _ = tx.send(value);
        }
    }
}

struct HandshakeWaiter {
    cell: OneShotCell<Result<HandshakeInfo, ConnError>>,
}

impl ConnectionObserver for HandshakeWaiter {
    fn on_new_state(&self, state: &ConnectionState) {
        match state {
            ConnectionState::Handshake(info) => self.cell.complete(Ok(info.clone())),
            ConnectionState::NoConnection => self.cell.complete(Err(ConnError::Closed)),
            _ => {}
        }
    }
}

struct CloseWaiter {
    cell: OneShotCell<()>,
}

impl ConnectionObserver for CloseWaiter {
    fn on_new_state(&self, state: &ConnectionState) {
        if matches!(state, ConnectionState::NoConnection) {
            self.cell.complete(());
        }
    }
}

/// 丢弃时把观察者从注册表移除
struct ObserverGuard {
    registry: Arc<ObserverRegistry>,
    observer: Arc<dyn ConnectionObserver>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.observer);
    }
}

impl P2pConnection {
    /// 等待握手完成
    ///
    /// 在第一个 `Handshake` 状态上成功解析；连接在等待期间掉到
    /// `NoConnection` 时以 `Closed` 失败解析，而不是永远挂起。
    /// 调用时已处于匹配状态则立即解析。
    pub async fn wait_handshaking(&self) -> Result<HandshakeInfo, ConnError> {
        let (tx, rx) = oneshot::channel();
        let waiter: Arc<dyn ConnectionObserver> = Arc::new(HandshakeWaiter {
            cell: OneShotCell::new(tx),
        });
        self.add_observer(waiter.clone());
        let _guard = ObserverGuard {
            registry: self.registry().clone(),
            observer: waiter,
        };

        // 订阅之后再检查当前状态，避免错过二者之间的转换
        match self.current_state() {
            ConnectionState::Handshake(info) => return Ok(info),
            ConnectionState::NoConnection => return Err(ConnError::Closed),
            _ => {}
        }

        rx.await.map_err(|_| ConnError::Closed)?
    }

    /// 等待连接回到 `NoConnection`
    ///
    /// 已处于 `NoConnection` 时立即返回。
    pub async fn wait_close(&self) {
        let (tx, rx) = oneshot::channel();
        let waiter: Arc<dyn ConnectionObserver> = Arc::new(CloseWaiter {
            cell: OneShotCell::new(tx),
        });
        self.add_observer(waiter.clone());
        let _guard = ObserverGuard {
            registry: self.registry().clone(),
            observer: waiter,
        };

        if matches!(self.current_state(), ConnectionState::NoConnection) {
            return;
        }

        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connection::ConnRole;

    fn test_conn(role: ConnRole) -> P2pConnection {
        P2pConnection::new(role, "test-device", std::env::temp_dir())
    }

    /// 取消等待后注册表恢复到调用前的大小，不留悬挂订阅
    #[tokio::test]
    async fn test_cancelled_wait_leaves_no_observer() {
        let conn = test_conn(ConnRole::Listener);
        conn.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let before = conn.observer_count();
        {
            let wait = conn.wait_handshaking();
            // 轮询一次后丢弃，模拟调用方取消
            let cancelled = tokio::time::timeout(std::time::Duration::ZERO, wait).await;
            assert!(cancelled.is_err());
        }
        assert_eq!(conn.observer_count(), before);
    }

    /// 等待期间连接关闭，以失败解析而不是挂起
    #[tokio::test]
    async fn test_wait_handshaking_resolves_on_close() {
        let conn = test_conn(ConnRole::Listener);
        conn.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_handshaking().await })
        };
        tokio::task::yield_now().await;

        conn.request_close().await.unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait must resolve")
            .unwrap();
        assert!(matches!(result, Err(ConnError::Closed)));
    }

    /// 已处于 NoConnection 时 wait_close 立即返回
    #[tokio::test]
    async fn test_wait_close_immediate() {
        let conn = test_conn(ConnRole::Connector);
        tokio::time::timeout(std::time::Duration::from_millis(100), conn.wait_close())
            .await
            .expect("must resolve immediately");
    }
}
