//! P2P 握手/传输线协议
//!
//! 单个套接字上的多路复用消息流，帧格式:
//!
//! ```text
//! [type: i32 BE][length: i32 BE][payload bytes]
//! ```
//!
//! 载荷为 JSON（camelCase 字段），两端必须对称——连接的两端运行同一套软件。
//! 控制帧载荷上限 64 KiB，超限视为协议错误。`TransferFileResp` 之后，
//! 流上紧接着的 `total_size` 个原始字节是文件内容，之后恢复帧格式。

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::conn::error::ConnError;

/// 当前协议主版本
///
/// 主版本不一致的握手会被监听端拒绝（保守策略，见 DESIGN.md）。
pub const PROTOCOL_VERSION: i32 = 1;

/// 单个控制帧载荷上限
pub const MAX_PAYLOAD_LEN: i32 = 64 * 1024;

/// 消息类型判别值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    HandshakeReq = 0,
    HandshakeResp = 1,
    TransferFileReq = 2,
    TransferFileResp = 3,
    CloseConnReq = 4,
    CloseConnResp = 5,
}

impl PacketType {
    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(PacketType::HandshakeReq),
            1 => Some(PacketType::HandshakeResp),
            2 => Some(PacketType::TransferFileReq),
            3 => Some(PacketType::TransferFileResp),
            4 => Some(PacketType::CloseConnReq),
            5 => Some(PacketType::CloseConnResp),
            _ => None,
        }
    }
}

/// 握手请求，连接方 → 监听方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReq {
    pub version: i32,
    pub device_name: String,
}

/// 握手响应，监听方 → 连接方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResp {
    pub device_name: String,
}

/// 文件传输请求，携带接收方写盘所需的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFileReq {
    pub task_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
}

pub(crate) fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, ConnError> {
    serde_json::to_vec(payload).map_err(|e| ConnError::Protocol(format!("encode failed: {e}")))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ConnError> {
    serde_json::from_slice(bytes).map_err(|e| ConnError::Protocol(format!("decode failed: {e}")))
}

/// 写出一个完整帧
pub async fn write_frame<W>(
    writer: &mut W,
    packet_type: PacketType,
    payload: &[u8],
) -> Result<(), ConnError>
where
    W: AsyncWrite + Unpin,
{
    let len = i32::try_from(payload.len())
        .map_err(|_| ConnError::Protocol("payload too large".to_string()))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(ConnError::Protocol(format!(
            "payload of {len} bytes exceeds frame limit"
        )));
    }

    writer
        .write_i32(packet_type.id())
        .await
        .map_err(|e| ConnError::Transfer(e.to_string()))?;
    writer
        .write_i32(len)
        .await
        .map_err(|e| ConnError::Transfer(e.to_string()))?;
    if !payload.is_empty() {
        writer
            .write_all(payload)
            .await
            .map_err(|e| ConnError::Transfer(e.to_string()))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| ConnError::Transfer(e.to_string()))?;
    Ok(())
}

/// 读入一个完整帧
///
/// 对端正常关闭（帧边界上的 EOF）返回 `ConnError::Closed`；
/// 未知类型、负长度或超限长度返回 `ConnError::Protocol`。
pub async fn read_frame<R>(reader: &mut R) -> Result<(PacketType, Vec<u8>), ConnError>
where
    R: AsyncRead + Unpin,
{
    let type_id = match reader.read_i32().await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ConnError::Closed);
        }
        Err(e) => return Err(ConnError::Transfer(e.to_string())),
    };

    let packet_type = PacketType::from_id(type_id)
        .ok_or_else(|| ConnError::Protocol(format!("unknown packet type {type_id}")))?;

    let len = reader
        .read_i32()
        .await
        .map_err(|e| ConnError::Transfer(e.to_string()))?;
    if !(0..=MAX_PAYLOAD_LEN).contains(&len) {
        return Err(ConnError::Protocol(format!("invalid frame length {len}")));
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| ConnError::Transfer(e.to_string()))?;
    }
    Ok((packet_type, payload))
}
