//! P2P 连接引擎
//!
//! 每个引擎实例独占一个套接字连接（监听方或连接方，角色在构造时注入），
//! 驱动握手与传输协议，并把生命周期写入连接状态机。
//!
//! 失败语义：套接字上的任何 I/O 错误都会立即拆除连接并转换到
//! `NoConnection`，引擎内部从不重试——重试策略属于 Facade 层。
//! 同一实例上同一时刻只允许一个传输/关闭序列在途，冲突的请求
//! 立刻以 `Busy` 失败，不会在共享套接字上交错写入。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conn::error::ConnError;
use crate::conn::observer::{ConnectionObserver, ObserverRegistry};
use crate::conn::protocol::{
    self, HandshakeReq, HandshakeResp, PROTOCOL_VERSION, PacketType, TransferFileReq,
};
use crate::conn::state::{ConnectionState, HandshakeInfo, StateCell};
use crate::transfer;

/// TCP 建连超时
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// 控制消息（握手/传输协商/关闭）应答超时
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// 引擎在套接字上扮演的角色，由构造方决定（通常是组主=监听方）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    /// 组主侧：bind 后等待对端接入
    Listener,
    /// 客户端侧：向组主地址发起 connect
    Connector,
}

/// P2P 连接引擎
///
/// 克隆开销低（内部为 `Arc`），但所有克隆共享同一条连接。
#[derive(Clone)]
pub struct P2pConnection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    role: ConnRole,
    device_name: String,
    download_dir: PathBuf,
    registry: Arc<ObserverRegistry>,
    state: StateCell,
    handshake: StdMutex<Option<HandshakeInfo>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: StdMutex<HashMap<PacketType, oneshot::Sender<Vec<u8>>>>,
    op_in_flight: AtomicBool,
    shutdown: CancellationToken,
}

/// 在途操作守卫，释放时清除忙标志
struct OpGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

enum Flow {
    Continue,
    Stop,
}

impl P2pConnection {
    pub fn new(role: ConnRole, device_name: impl Into<String>, download_dir: PathBuf) -> Self {
        let registry = Arc::new(ObserverRegistry::new());
        Self {
            inner: Arc::new(ConnInner {
                role,
                device_name: device_name.into(),
                download_dir,
                state: StateCell::new(registry.clone()),
                registry,
                handshake: StdMutex::new(None),
                writer: Mutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                op_in_flight: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn role(&self) -> ConnRole {
        self.inner.role
    }

    /// 当前状态的快照读取（可能落后一次转换，不会读到撕裂值）
    pub fn current_state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner.registry.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>) {
        self.inner.registry.remove(observer);
    }

    /// 当前注册的观察者数量
    pub fn observer_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub(crate) fn registry(&self) -> &Arc<ObserverRegistry> {
        &self.inner.registry
    }

    /// 监听 `local`，在后台接受恰好一个对端接入
    ///
    /// 返回实际绑定到的地址（端口 0 时由内核分配）。接入后状态转换到
    /// `Active`，监听侧的握手由后台读取循环完成；用 [`wait_handshaking`]
    /// 等待握手完成。
    ///
    /// [`wait_handshaking`]: P2pConnection::wait_handshaking
    pub async fn bind(&self, local: SocketAddr) -> Result<SocketAddr, ConnError> {
        if self.inner.role != ConnRole::Listener {
            return Err(ConnError::Bind(
                "bind is a listener-role operation".to_string(),
            ));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(ConnError::Closed);
        }

        self.inner.state.publish(ConnectionState::Requesting);
        let listener = match TcpListener::bind(local).await {
            Ok(l) => l,
            Err(e) => {
                self.inner.state.publish(ConnectionState::NoConnection);
                return Err(ConnError::Bind(e.to_string()));
            }
        };
        let bound = listener
            .local_addr()
            .map_err(|e| ConnError::Bind(e.to_string()))?;
        info!("Listening for peer on {bound}");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let accepted = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => {
                    info!("Peer connected from {peer}");
                    if let Err(e) = ConnInner::install_stream(&inner, stream).await {
                        warn!("Failed to set up accepted connection: {e}");
                        inner.teardown("socket setup failed").await;
                    }
                }
                Err(e) => {
                    warn!("Accept failed: {e}");
                    inner.teardown("accept failed").await;
                }
            }
        });
        Ok(bound)
    }

    /// 作为连接方向 `remote` 建连并完成握手
    ///
    /// TCP 建连有界超时（[`CONNECT_TIMEOUT`]），随后发送握手请求并等待
    /// 响应（[`CONTROL_TIMEOUT`]）。成功时返回双端身份信息，
    /// 状态依次经过 `Requesting → Active → Handshake`。
    pub async fn connect(&self, remote: SocketAddr) -> Result<HandshakeInfo, ConnError> {
        if self.inner.role != ConnRole::Connector {
            return Err(ConnError::Connect(
                "connect is a connector-role operation".to_string(),
            ));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(ConnError::Closed);
        }

        self.inner.state.publish(ConnectionState::Requesting);
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.inner.state.publish(ConnectionState::NoConnection);
                return Err(ConnError::Connect(e.to_string()));
            }
            Err(_) => {
                self.inner.state.publish(ConnectionState::NoConnection);
                return Err(ConnError::Connect(format!(
                    "timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
        };

        if let Err(e) = ConnInner::install_stream(&self.inner, stream).await {
            self.inner.teardown("socket setup failed").await;
            return Err(e);
        }

        // 先注册响应槽再发请求，避免响应早于等待者到达
        let rx = self.inner.expect_response(PacketType::HandshakeResp);
        let req = HandshakeReq {
            version: PROTOCOL_VERSION,
            device_name: self.inner.device_name.clone(),
        };
        if let Err(e) = self
            .inner
            .send_frame(PacketType::HandshakeReq, &protocol::encode(&req)?)
            .await
        {
            self.inner.teardown("handshake send failed").await;
            return Err(e);
        }

        match timeout(CONTROL_TIMEOUT, rx).await {
            Ok(Ok(_payload)) => {}
            Ok(Err(_)) => return Err(ConnError::Closed),
            Err(_) => {
                self.inner.teardown("handshake timed out").await;
                return Err(ConnError::Protocol("handshake timed out".to_string()));
            }
        }

        // 读取循环在路由响应前已写入握手信息
        self.inner
            .handshake
            .lock()
            .unwrap()
            .clone()
            .ok_or(ConnError::Closed)
    }

    /// 请求向对端传输一个文件
    ///
    /// 仅在握手完成后有效。发送 `TransferFileReq`，等待 `TransferFileResp`，
    /// 然后在同一套接字上流式发送文件字节，经由 `Transferring` 状态上报
    /// 进度，完成后回到 `Handshake`。已有传输/关闭在途时立刻返回 `Busy`。
    pub async fn request_transfer_file(&self, path: &Path) -> Result<(), ConnError> {
        let _guard = self.inner.begin_op()?;
        let hs = self
            .inner
            .handshake
            .lock()
            .unwrap()
            .clone()
            .ok_or(ConnError::Closed)?;

        let meta = build_transfer_meta(path).await?;
        debug!(
            "Requesting transfer of {} ({} bytes, {})",
            meta.file_name, meta.total_size, meta.mime_type
        );
        self.inner.registry.notify_transfer_request(&hs, false);

        let rx = self.inner.expect_response(PacketType::TransferFileResp);
        if let Err(e) = self
            .inner
            .send_frame(PacketType::TransferFileReq, &protocol::encode(&meta)?)
            .await
        {
            self.inner.remove_pending(PacketType::TransferFileResp);
            if !matches!(e, ConnError::Closed) {
                self.inner.teardown("transfer request send failed").await;
            }
            return Err(e);
        }
        match timeout(CONTROL_TIMEOUT, rx).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(ConnError::Closed),
            Err(_) => {
                self.inner.remove_pending(PacketType::TransferFileResp);
                return Err(ConnError::Transfer(
                    "no response to transfer request".to_string(),
                ));
            }
        }

        // 持有写半区直到流发送完成，避免控制帧插入原始字节流
        let result = {
            let mut writer_guard = self.inner.writer.lock().await;
            match writer_guard.as_mut() {
                Some(writer) => {
                    transfer::send_file(path, meta.total_size, writer, &self.inner.state).await
                }
                None => Err(ConnError::Closed),
            }
        };
        if let Err(e) = result {
            self.inner.teardown("transfer failed").await;
            return Err(e);
        }

        self.inner.state.publish(ConnectionState::Handshake(hs));
        Ok(())
    }

    /// 优雅关闭连接
    ///
    /// 发送 `CloseConnReq`，等待应答或超时，之后无论对端是否确认都关闭
    /// 套接字并转换到 `NoConnection`。已处于 `NoConnection` 时为空操作。
    pub async fn request_close(&self) -> Result<(), ConnError> {
        if matches!(self.inner.state.current(), ConnectionState::NoConnection) {
            return Ok(());
        }
        let _guard = self.inner.begin_op()?;

        let rx = self.inner.expect_response(PacketType::CloseConnResp);
        if self
            .inner
            .send_frame(PacketType::CloseConnReq, &[])
            .await
            .is_ok()
        {
            if timeout(CONTROL_TIMEOUT, rx).await.is_err() {
                debug!("Close ack not received before timeout");
            }
        }
        self.inner.teardown("close requested").await;
        Ok(())
    }
}

impl ConnInner {
    /// 套接字就绪：装配写半区、发布 `Active`、启动读取循环
    async fn install_stream(inner: &Arc<ConnInner>, stream: TcpStream) -> Result<(), ConnError> {
        let _ = stream.set_nodelay(true);
        let local = stream
            .local_addr()
            .map_err(|e| ConnError::Transfer(e.to_string()))?;
        let remote = stream
            .peer_addr()
            .map_err(|e| ConnError::Transfer(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        *inner.writer.lock().await = Some(write_half);
        inner.state.publish(ConnectionState::Active {
            local_address: local,
            remote_address: remote,
        });

        let loop_inner = inner.clone();
        tokio::spawn(async move {
            ConnInner::reader_loop(loop_inner, read_half, local, remote).await;
        });
        Ok(())
    }

    async fn reader_loop(
        inner: Arc<ConnInner>,
        mut reader: OwnedReadHalf,
        local: SocketAddr,
        remote: SocketAddr,
    ) {
        loop {
            let frame = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                frame = protocol::read_frame(&mut reader) => frame,
            };
            match frame {
                Ok((packet_type, payload)) => {
                    match Self::dispatch(&inner, &mut reader, packet_type, payload, local, remote)
                        .await
                    {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(e) => {
                            warn!("Protocol failure: {e}");
                            inner.teardown("protocol failure").await;
                            break;
                        }
                    }
                }
                Err(ConnError::Closed) => {
                    info!("Peer closed the connection");
                    inner.teardown("peer closed").await;
                    break;
                }
                Err(e) => {
                    warn!("Socket read failed: {e}");
                    inner.teardown("read failed").await;
                    break;
                }
            }
        }
    }

    async fn dispatch(
        inner: &Arc<ConnInner>,
        reader: &mut OwnedReadHalf,
        packet_type: PacketType,
        payload: Vec<u8>,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Flow, ConnError> {
        match packet_type {
            PacketType::HandshakeReq => {
                if inner.role != ConnRole::Listener {
                    return Err(ConnError::Protocol(
                        "unexpected handshake request".to_string(),
                    ));
                }
                let req: HandshakeReq = protocol::decode(&payload)?;
                // 保守策略：主版本不一致直接拒绝
                if req.version != PROTOCOL_VERSION {
                    return Err(ConnError::Protocol(format!(
                        "unsupported protocol version {} (local {})",
                        req.version, PROTOCOL_VERSION
                    )));
                }
                let resp = HandshakeResp {
                    device_name: inner.device_name.clone(),
                };
                inner
                    .send_frame(PacketType::HandshakeResp, &protocol::encode(&resp)?)
                    .await?;

                let info = HandshakeInfo {
                    local_address: local,
                    remote_address: remote,
                    remote_device_name: req.device_name,
                };
                info!("Handshake complete with {}", info.remote_device_name);
                *inner.handshake.lock().unwrap() = Some(info.clone());
                inner.state.publish(ConnectionState::Handshake(info));
                Ok(Flow::Continue)
            }

            PacketType::HandshakeResp => {
                let tx = inner.take_pending(packet_type).ok_or_else(|| {
                    ConnError::Protocol("unexpected handshake response".to_string())
                })?;
                let resp: HandshakeResp = protocol::decode(&payload)?;
                let info = HandshakeInfo {
                    local_address: local,
                    remote_address: remote,
                    remote_device_name: resp.device_name,
                };
                info!("Handshake complete with {}", info.remote_device_name);
                *inner.handshake.lock().unwrap() = Some(info.clone());
                inner.state.publish(ConnectionState::Handshake(info));
                // 等待者已取消时静默丢弃
                let _ = tx.send(payload);
                Ok(Flow::Continue)
            }

            PacketType::TransferFileResp | PacketType::CloseConnResp => {
                match inner.take_pending(packet_type) {
                    Some(tx) => {
                        let _ = tx.send(payload);
                        Ok(Flow::Continue)
                    }
                    None => Err(ConnError::Protocol(format!(
                        "unexpected response {packet_type:?}"
                    ))),
                }
            }

            PacketType::TransferFileReq => {
                let meta: TransferFileReq = protocol::decode(&payload)?;
                let hs = inner.handshake.lock().unwrap().clone().ok_or_else(|| {
                    ConnError::Protocol("transfer requested before handshake".to_string())
                })?;
                inner.registry.notify_transfer_request(&hs, true);
                inner.send_frame(PacketType::TransferFileResp, &[]).await?;

                // 应答之后，流上紧接着的 total_size 个字节是文件内容
                transfer::receive_file(reader, &meta, &inner.download_dir, &inner.state).await?;
                inner.state.publish(ConnectionState::Handshake(hs));
                Ok(Flow::Continue)
            }

            PacketType::CloseConnReq => {
                let _ = inner.send_frame(PacketType::CloseConnResp, &[]).await;
                inner.teardown("close requested by peer").await;
                Ok(Flow::Stop)
            }
        }
    }

    fn begin_op(&self) -> Result<OpGuard<'_>, ConnError> {
        if self
            .op_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConnError::Busy);
        }
        Ok(OpGuard {
            flag: &self.op_in_flight,
        })
    }

    fn expect_response(&self, packet_type: PacketType) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(packet_type, tx);
        rx
    }

    fn take_pending(&self, packet_type: PacketType) -> Option<oneshot::Sender<Vec<u8>>> {
        self.pending.lock().unwrap().remove(&packet_type)
    }

    fn remove_pending(&self, packet_type: PacketType) {
        self.pending.lock().unwrap().remove(&packet_type);
    }

    async fn send_frame(&self, packet_type: PacketType, payload: &[u8]) -> Result<(), ConnError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnError::Closed)?;
        protocol::write_frame(writer, packet_type, payload).await
    }

    /// 拆除连接：取消后台任务、丢弃写半区、清空在途等待并复位状态
    async fn teardown(&self, reason: &str) {
        if !self.shutdown.is_cancelled() {
            debug!("Tearing down connection: {reason}");
            self.shutdown.cancel();
        }
        self.pending.lock().unwrap().clear();
        self.handshake.lock().unwrap().take();
        self.writer.lock().await.take();
        self.state.publish(ConnectionState::NoConnection);
    }
}

async fn build_transfer_meta(path: &Path) -> Result<TransferFileReq, ConnError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| ConnError::Transfer(format!("stat {}: {e}", path.display())))?;
    if !metadata.is_file() {
        return Err(ConnError::Transfer(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file.bin".to_string());
    let mime_type = mime_guess::from_path(path)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Ok(TransferFileReq {
        task_id: Uuid::new_v4().to_string(),
        file_name,
        mime_type,
        total_size: metadata.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(role: ConnRole) -> P2pConnection {
        P2pConnection::new(role, "test-device", std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_connect_rejected_for_listener_role() {
        let conn = test_conn(ConnRole::Listener);
        let err = conn.connect("127.0.0.1:1".parse().unwrap()).await;
        assert!(matches!(err, Err(ConnError::Connect(_))));
    }

    #[tokio::test]
    async fn test_bind_rejected_for_connector_role() {
        let conn = test_conn(ConnRole::Connector);
        let err = conn.bind("127.0.0.1:0".parse().unwrap()).await;
        assert!(matches!(err, Err(ConnError::Bind(_))));
    }

    /// 地址被占用时 bind 失败并回落到 NoConnection
    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = test_conn(ConnRole::Listener);
        let addr = first.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let second = test_conn(ConnRole::Listener);
        let err = second.bind(addr).await;
        assert!(matches!(err, Err(ConnError::Bind(_))));
        assert_eq!(second.current_state(), ConnectionState::NoConnection);
    }

    #[tokio::test]
    async fn test_transfer_without_handshake_is_closed() {
        let conn = test_conn(ConnRole::Connector);
        let err = conn.request_transfer_file(Path::new("/nonexistent")).await;
        assert!(matches!(err, Err(ConnError::Closed)));
    }

    /// 从 NoConnection 调用 request_close 是幂等空操作
    #[tokio::test]
    async fn test_close_is_noop_without_connection() {
        let conn = test_conn(ConnRole::Connector);
        conn.request_close().await.unwrap();
        conn.request_close().await.unwrap();
        assert_eq!(conn.current_state(), ConnectionState::NoConnection);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let conn = test_conn(ConnRole::Connector);
        // 端口 1 上没有监听者
        let err = conn.connect("127.0.0.1:1".parse().unwrap()).await;
        assert!(matches!(err, Err(ConnError::Connect(_))));
        assert_eq!(conn.current_state(), ConnectionState::NoConnection);
    }
}
