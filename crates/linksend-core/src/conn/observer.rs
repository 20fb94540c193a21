//! 观察者注册表
//!
//! 线程安全的多订阅者通知机制。注册/移除可以在观察者自己的回调内调用
//! （自移除），也可以与进行中的扇出并发调用——扇出遍历的是注册表的快照，
//! 不受并发变更影响。同一句柄可以重复注册，不做去重。

use std::sync::{Arc, Mutex};

use crate::conn::state::{ConnectionState, HandshakeInfo};

/// 连接事件观察者
///
/// 回调在执行状态转换的任务上同步调用，不得阻塞；耗时工作必须转发出去。
pub trait ConnectionObserver: Send + Sync {
    /// 状态机接受了一次新的状态转换
    fn on_new_state(&self, state: &ConnectionState);

    /// 对端（或本端）发起了文件传输请求
    ///
    /// `is_receiver` 为 true 表示本端是接收方。
    fn request_transfer_file(&self, handshake: &HandshakeInfo, is_receiver: bool) {
        let _ = (handshake, is_receiver);
    }
}

/// 观察者集合，按注册顺序扇出，按句柄身份移除
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn ConnectionObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// 按身份（`Arc::ptr_eq`）移除第一个匹配的句柄；已移除时为空操作
    pub fn remove(&self, observer: &Arc<dyn ConnectionObserver>) {
        let mut observers = self.observers.lock().unwrap();
        if let Some(pos) = observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
            observers.remove(pos);
        }
    }

    pub fn clear(&self) {
        self.observers.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 向快照中的所有观察者按注册顺序通知状态转换
    pub fn notify_state(&self, state: &ConnectionState) {
        for observer in self.snapshot() {
            observer.on_new_state(state);
        }
    }

    /// 通知传输请求
    pub fn notify_transfer_request(&self, handshake: &HandshakeInfo, is_receiver: bool) {
        for observer in self.snapshot() {
            observer.request_transfer_file(handshake, is_receiver);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers.lock().unwrap().clone()
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
