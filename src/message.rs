//! 컨트롤 채널 프로토콜
//!
//! 프레임 = `u32` 빅엔디안 길이 + UTF-8 JSON 본문.
//! 엔벨로프는 `{"type": <이름>, "payload": <객체>}`.
//!
//! 스키마는 엄격하다. 필수 필드 누락이나 타입 불일치는 모두
//! `Protocol` 에러가 되고, 수신측은 치명 ERROR를 보낸 뒤 끊는다.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{Error, Result, MAX_CONTROL_FRAME, MAX_FILES_PER_TRANSFER};

/// FILE_LIST 항목의 파일명 최대 길이 (바이트)
const MAX_WIRE_NAME: usize = 1024;

/// 핸드쉐이크 장치 이름 최대 길이 (바이트, 초과분은 잘라냄)
const MAX_WIRE_DEVICE_NAME: usize = 256;

/// 핸드쉐이크에 실리는 장치 요약
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub os: String,
}

/// HANDSHAKE / HANDSHAKE_ACK 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    pub device: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

/// FILE_LIST의 파일 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: u32,
    pub name: String,
    pub size: u64,
}

/// FILE_LIST 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub total_size: u64,
}

/// ACCEPT / REJECT 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptReject {
    pub accepted: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub data_port: u16,
}

/// PAUSE / RESUME / CANCEL 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlAction {
    pub action: String,
    /// 0이면 전체 파일 대상
    #[serde(default)]
    pub file_id: u32,
}

/// PROGRESS 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub file_id: u32,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    #[serde(default)]
    pub speed_bps: f64,
}

/// RESUME_REQUEST 페이로드 (수신자 → 송신자)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub file_id: u32,
    #[serde(default)]
    pub received_chunks: Vec<u32>,
    #[serde(default)]
    pub received_bytes: u64,
}

/// COMPLETE 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Complete {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub files_transferred: u32,
    #[serde(default)]
    pub bytes_transferred: u64,
}

/// ERROR 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    /// true면 연결이 곧 닫힌다
    #[serde(default)]
    pub fatal: bool,
}

impl ErrorInfo {
    /// 엔진 에러를 온와이어 표현으로
    pub fn from_error(err: &Error, fatal: bool) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            fatal,
        }
    }

    /// 온와이어 표현을 엔진 에러로
    pub fn into_error(self) -> Error {
        Error::from_code(self.code, self.message)
    }
}

/// 컨트롤 메시지
///
/// serde 태그가 엔벨로프의 `type`, 내용이 `payload`가 된다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    Handshake(Handshake),
    HandshakeAck(Handshake),
    FileList(FileList),
    Accept(AcceptReject),
    Reject(AcceptReject),
    Start {},
    Pause(ControlAction),
    Resume(ControlAction),
    Cancel(ControlAction),
    Progress(Progress),
    ResumeRequest(ResumeRequest),
    Complete(Complete),
    Error(ErrorInfo),
}

impl ControlMessage {
    /// 와이어 타입 이름 (로그용)
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Handshake(_) => "HANDSHAKE",
            ControlMessage::HandshakeAck(_) => "HANDSHAKE_ACK",
            ControlMessage::FileList(_) => "FILE_LIST",
            ControlMessage::Accept(_) => "ACCEPT",
            ControlMessage::Reject(_) => "REJECT",
            ControlMessage::Start {} => "START",
            ControlMessage::Pause(_) => "PAUSE",
            ControlMessage::Resume(_) => "RESUME",
            ControlMessage::Cancel(_) => "CANCEL",
            ControlMessage::Progress(_) => "PROGRESS",
            ControlMessage::ResumeRequest(_) => "RESUME_REQUEST",
            ControlMessage::Complete(_) => "COMPLETE",
            ControlMessage::Error(_) => "ERROR",
        }
    }

    /// 길이 프리픽스를 포함해 직렬화
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Internal(e.to_string()))?;
        if json.len() as u64 > MAX_CONTROL_FRAME as u64 {
            return Err(Error::Protocol(format!("프레임 과대: {} bytes", json.len())));
        }

        let mut buf = Vec::with_capacity(4 + json.len());
        buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    /// 프리픽스를 제외한 본문에서 역직렬화하고 한도를 검증
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut msg: ControlMessage = serde_json::from_slice(data)
            .map_err(|e| Error::Protocol(format!("메시지 해석 실패: {e}")))?;
        msg.enforce_limits()?;
        Ok(msg)
    }

    fn enforce_limits(&mut self) -> Result<()> {
        match self {
            ControlMessage::Handshake(h) | ControlMessage::HandshakeAck(h) => {
                // 장치 이름 초과분은 거부하지 않고 잘라낸다
                while h.device.name.len() > MAX_WIRE_DEVICE_NAME {
                    h.device.name.pop();
                }
            }
            ControlMessage::FileList(list) => {
                if list.files.len() > MAX_FILES_PER_TRANSFER {
                    return Err(Error::Protocol(format!(
                        "파일 수 초과: {}",
                        list.files.len()
                    )));
                }
                for file in &list.files {
                    if file.name.len() > MAX_WIRE_NAME {
                        return Err(Error::Protocol("파일명 과대".into()));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn map_recv_err(e: std::io::Error) -> Error {
    // 요청한 길이를 채우기 전의 EOF는 항상 연결 종료다
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::SocketRecv(e.to_string())
    }
}

/// 스트림에서 컨트롤 메시지 하나 읽기
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<ControlMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(map_recv_err)?;

    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_CONTROL_FRAME {
        return Err(Error::Protocol(format!("잘못된 프레임 길이: {len}")));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.map_err(map_recv_err)?;

    let msg = ControlMessage::decode(&body)?;
    debug!("수신: {}", msg.type_name());
    Ok(msg)
}

/// 타임아웃을 걸어 컨트롤 메시지 읽기
pub async fn read_message_timeout<R: AsyncRead + Unpin>(
    stream: &mut R,
    timeout_ms: u64,
) -> Result<ControlMessage> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), read_message(stream))
        .await
        .map_err(|_| Error::Timeout(format!("{timeout_ms}ms 내 메시지 없음")))?
}

/// 컨트롤 메시지 쓰기
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg: &ControlMessage,
) -> Result<()> {
    let data = msg.encode()?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| Error::SocketSend(e.to_string()))?;
    debug!("송신: {}", msg.type_name());
    Ok(())
}
