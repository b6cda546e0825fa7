//! 전송 파이프라인 공용 부품
//!
//! 작업 큐, 일시정지/취소 제어, 데이터 스트림 튜닝, 타임아웃 I/O.
//! 송신과 수신 파이프라인이 같은 부품을 쓴다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::stats::TransferStats;
use crate::{Error, Result};

/// 연결 타임아웃 (밀리초)
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// 핸드쉐이크 수신 타임아웃 (밀리초)
pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// 전송 중 소켓 I/O 타임아웃 (밀리초)
pub const SOCKET_TIMEOUT_MS: u64 = 30_000;

/// 데이터 스트림 소켓 버퍼 크기 (4 MiB)
pub const DATA_STREAM_BUFFER: usize = 4 * 1024 * 1024;

/// 진행 콜백. 내부 워커 태스크에서 호출된다.
pub type OnProgress = Arc<dyn Fn(&TransferStats) + Send + Sync>;

/// 완료 콜백. 성공이면 최종 통계, 실패면 에러.
pub type OnComplete = Arc<dyn Fn(&Result<TransferStats>) + Send + Sync>;

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Connecting,
    Handshaking,
    Transferring,
    Paused,
    Completing,
    Complete,
    Failed,
    Cancelled,
}

impl TransferState {
    /// 더 진행될 수 없는 상태인지
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// 일시정지/취소 제어
///
/// 워커는 청크 경계마다 [`TransferControl::checkpoint`]를 지난다.
/// 일시정지 동안 Notify를 기다리고, cancel은 일시정지를 풀며
/// 대기자 전원을 깨운다. 두 연산 모두 멱등이다.
pub struct TransferControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    notify: Notify,
}

impl TransferControl {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 청크 경계 체크포인트
    ///
    /// 취소면 즉시 `Cancelled`, 일시정지면 재개 통지까지 대기한다.
    pub async fn checkpoint(&self) -> Result<()> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if !self.paused.load(Ordering::SeqCst) {
                return Ok(());
            }

            let notified = self.notify.notified();
            // 대기 등록 후 재확인해야 깨움을 놓치지 않는다
            if !self.paused.load(Ordering::SeqCst) || self.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            notified.await;
        }
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// 전송 작업 항목 (한 파일의 한 청크)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWork {
    pub file_id: u32,
    pub chunk_id: u32,
    pub offset: u64,
    pub size: u32,
}

/// 뮤텍스 보호 작업 큐
///
/// 어느 스트림이든 어느 청크든 실어 나를 수 있으므로 워커는
/// 여기서 원자적으로 pop만 하면 된다.
pub struct WorkQueue {
    items: Mutex<VecDeque<ChunkWork>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, work: ChunkWork) {
        self.items.lock().push_back(work);
    }

    pub fn pop(&self) -> Option<ChunkWork> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// 데이터 스트림 튜닝: TCP_NODELAY + 대형 송수신 버퍼
pub fn tune_data_stream(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| Error::SocketCreate(e.to_string()))?;

    let sock = socket2::SockRef::from(stream);
    sock.set_send_buffer_size(DATA_STREAM_BUFFER)
        .map_err(|e| Error::SocketCreate(e.to_string()))?;
    sock.set_recv_buffer_size(DATA_STREAM_BUFFER)
        .map_err(|e| Error::SocketCreate(e.to_string()))?;
    Ok(())
}

/// 타임아웃을 걸어 전부 쓰기 (부분 쓰기는 내부에서 루프)
pub async fn write_all_timeout<W: AsyncWrite + Unpin>(stream: &mut W, buf: &[u8]) -> Result<()> {
    tokio::time::timeout(Duration::from_millis(SOCKET_TIMEOUT_MS), stream.write_all(buf))
        .await
        .map_err(|_| Error::Timeout("송신 타임아웃".into()))?
        .map_err(|e| Error::SocketSend(e.to_string()))
}

/// 타임아웃을 걸어 정확히 읽기
///
/// 요청 길이 전의 EOF는 조용한 잘림이 아니라 `ConnectionClosed`다.
pub async fn read_exact_timeout<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    let read = tokio::time::timeout(
        Duration::from_millis(SOCKET_TIMEOUT_MS),
        stream.read_exact(buf),
    )
    .await
    .map_err(|_| Error::Timeout("수신 타임아웃".into()))?;

    match read {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(Error::SocketRecv(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_work_queue_fifo() {
        let queue = WorkQueue::new();
        for chunk_id in 0..4 {
            queue.push(ChunkWork {
                file_id: 0,
                chunk_id,
                offset: chunk_id as u64 * 1024,
                size: 1024,
            });
        }

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop().unwrap().chunk_id, 0);
        assert_eq!(queue.pop().unwrap().chunk_id, 1);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_passes_when_running() {
        let control = TransferControl::new();
        assert!(control.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_fails_checkpoint() {
        let control = TransferControl::new();
        control.cancel();
        assert!(matches!(control.checkpoint().await, Err(Error::Cancelled)));
        // 멱등
        control.cancel();
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let control = Arc::new(TransferControl::new());
        let passed = Arc::new(AtomicU32::new(0));

        control.pause();

        let mut workers = Vec::new();
        for _ in 0..4 {
            let control = control.clone();
            let passed = passed.clone();
            workers.push(tokio::spawn(async move {
                control.checkpoint().await.unwrap();
                passed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        control.resume();
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancel_wakes_paused_workers() {
        let control = Arc::new(TransferControl::new());
        control.pause();

        let worker = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("취소 후에도 워커가 깨어나지 않음")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Complete.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(!TransferState::Transferring.is_terminal());
        assert!(!TransferState::Paused.is_terminal());
    }
}
