//! 송신 세션
//!
//! 컨트롤 채널에서 상태 머신을 걷는다:
//! Idle → Connecting → Handshaking → Transferring → Completing → Complete.
//! ACCEPT 이후 N개 데이터 스트림을 열고 작업 큐의 청크를 분배한다.
//! 일시정지/취소는 송신측 로컬 동작이고, 취소 시에만 CANCEL 프레임을
//! 참고용으로 흘려 보낸다.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::chunk::{self, ChunkHeader};
use crate::config::Config;
use crate::device::OsType;
use crate::message::{
    self, ControlAction, ControlMessage, DeviceInfo, FileEntry, FileList, Handshake,
};
use crate::stats::TransferStats;
use crate::transfer::{
    self, ChunkWork, OnProgress, TransferControl, TransferState, WorkQueue, CONNECT_TIMEOUT_MS,
    HANDSHAKE_TIMEOUT_MS, SOCKET_TIMEOUT_MS,
};
use crate::{Error, Result, PROTOCOL_VERSION};

/// 전송할 파일 하나 (송신측 로컬 경로 포함)
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    /// 세션 범위 id, 0부터 순서대로
    pub id: u32,
    pub path: PathBuf,
    /// 디렉터리 없는 파일명
    pub name: String,
    pub size: u64,
}

/// 송신 세션
pub struct SenderSession {
    config: Config,
    control: Arc<TransferControl>,
    state: Arc<Mutex<TransferState>>,
    stats: Arc<Mutex<TransferStats>>,
}

impl SenderSession {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            control: Arc::new(TransferControl::new()),
            state: Arc::new(Mutex::new(TransferState::Idle)),
            stats: Arc::new(Mutex::new(TransferStats::new())),
        }
    }

    pub fn control(&self) -> Arc<TransferControl> {
        self.control.clone()
    }

    pub fn state_handle(&self) -> Arc<Mutex<TransferState>> {
        self.state.clone()
    }

    pub fn stats_handle(&self) -> Arc<Mutex<TransferStats>> {
        self.stats.clone()
    }

    fn set_state(&self, state: TransferState) {
        *self.state.lock() = state;
        debug!("송신 세션 상태: {state:?}");
    }

    /// 세션 실행. 종료 시 상태를 Complete/Failed/Cancelled 중 하나로 남긴다.
    pub async fn run(
        &self,
        target: SocketAddr,
        paths: Vec<PathBuf>,
        on_progress: Option<OnProgress>,
    ) -> Result<TransferStats> {
        let result = self.run_inner(target, paths, on_progress).await;

        match &result {
            Ok(_) => self.set_state(TransferState::Complete),
            Err(Error::Cancelled) => self.set_state(TransferState::Cancelled),
            Err(_) => self.set_state(TransferState::Failed),
        }
        result
    }

    async fn run_inner(
        &self,
        target: SocketAddr,
        paths: Vec<PathBuf>,
        on_progress: Option<OnProgress>,
    ) -> Result<TransferStats> {
        let files = enumerate_files(&paths).await?;

        {
            let mut stats = self.stats.lock();
            *stats = TransferStats::new();
            stats.files_total = files.len() as u32;
            stats.bytes_total = files.iter().map(|f| f.size).sum();
            stats.chunks_total = files
                .iter()
                .map(|f| chunk::chunk_count(f.size, self.config.chunk_size))
                .sum();
        }

        info!("Sending {} files to {target}", files.len());

        // 연결
        self.set_state(TransferState::Connecting);
        let mut control_stream = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            TcpStream::connect(target),
        )
        .await
        .map_err(|_| Error::Timeout(format!("{target} 연결 {CONNECT_TIMEOUT_MS}ms 초과")))?
        .map_err(|e| Error::SocketConnect(format!("{target}: {e}")))?;

        // 핸드쉐이크
        self.set_state(TransferState::Handshaking);
        let session_token = self.perform_handshake(&mut control_stream).await?;
        debug!("세션 토큰 수신 ({} bytes)", session_token.len());

        // 파일 목록
        let entries: Vec<FileEntry> = files
            .iter()
            .map(|f| FileEntry {
                id: f.id,
                name: f.name.clone(),
                size: f.size,
            })
            .collect();
        let total_size = files.iter().map(|f| f.size).sum();
        message::write_message(
            &mut control_stream,
            &ControlMessage::FileList(FileList {
                files: entries,
                total_size,
            }),
        )
        .await?;

        // 수락 대기. RESUME_REQUEST는 ACCEPT 앞에 온다.
        let (data_port, skip) = self.wait_for_acceptance(&mut control_stream).await?;
        info!("Transfer accepted, data port {data_port}");

        // START
        message::write_message(&mut control_stream, &ControlMessage::Start {}).await?;

        // 전송
        self.set_state(TransferState::Transferring);
        let result = self
            .dispatch_chunks(target, data_port, &files, &skip, on_progress)
            .await;

        if let Err(e) = result {
            if matches!(e, Error::Cancelled) {
                // 참고용 CANCEL. 수신측은 소켓 종료만으로도 같은 결론에 이른다.
                let cancel = ControlMessage::Cancel(ControlAction {
                    action: "cancel".into(),
                    file_id: 0,
                });
                let _ = message::write_message(&mut control_stream, &cancel).await;
            }
            return Err(e);
        }

        {
            let mut stats = self.stats.lock();
            stats.files_completed = stats.files_total;
            stats.refresh_rate();
        }

        // 완료 확인
        self.set_state(TransferState::Completing);
        match message::read_message_timeout(&mut control_stream, SOCKET_TIMEOUT_MS).await? {
            ControlMessage::Complete(done) if done.success => {
                info!(
                    "Transfer complete: {} files, {} bytes",
                    done.files_transferred, done.bytes_transferred
                );
            }
            ControlMessage::Complete(done) => {
                return Err(Error::TransferFailed(if done.message.is_empty() {
                    "수신측 실패".into()
                } else {
                    done.message
                }));
            }
            ControlMessage::Error(info) => return Err(info.into_error()),
            other => {
                return Err(Error::Protocol(format!(
                    "COMPLETE 기대, {} 수신",
                    other.type_name()
                )))
            }
        }

        Ok(self.stats.lock().clone())
    }

    async fn perform_handshake(&self, stream: &mut TcpStream) -> Result<String> {
        let handshake = ControlMessage::Handshake(Handshake {
            protocol_version: PROTOCOL_VERSION,
            device: DeviceInfo {
                name: self.config.device_name.clone(),
                os: OsType::current().as_str().to_string(),
            },
            session_token: None,
        });
        message::write_message(stream, &handshake).await?;

        let ack = match message::read_message_timeout(stream, HANDSHAKE_TIMEOUT_MS).await {
            Err(Error::Timeout(_)) => {
                return Err(Error::Timeout("수신측이 응답하지 않음".into()))
            }
            other => other?,
        };

        match ack {
            ControlMessage::HandshakeAck(ack) => Ok(ack.session_token.unwrap_or_default()),
            ControlMessage::Error(info) => Err(info.into_error()),
            other => Err(Error::Protocol(format!(
                "HANDSHAKE_ACK 기대, {} 수신",
                other.type_name()
            ))),
        }
    }

    /// ACCEPT/REJECT까지 읽으며 RESUME_REQUEST를 수집한다
    async fn wait_for_acceptance(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(u16, HashMap<u32, HashSet<u32>>)> {
        let mut skip: HashMap<u32, HashSet<u32>> = HashMap::new();

        loop {
            let msg = message::read_message_timeout(stream, HANDSHAKE_TIMEOUT_MS).await?;
            match msg {
                ControlMessage::ResumeRequest(req) => {
                    debug!(
                        "이어받기 요청: file {} ({} 청크 보유)",
                        req.file_id,
                        req.received_chunks.len()
                    );
                    skip.entry(req.file_id).or_default().extend(req.received_chunks);
                }
                ControlMessage::Accept(acc) if acc.accepted => return Ok((acc.data_port, skip)),
                ControlMessage::Accept(_) => {
                    return Err(Error::Protocol("accepted=false인 ACCEPT".into()))
                }
                ControlMessage::Reject(rej) => {
                    warn!("Transfer rejected: {}", rej.reason);
                    return Err(Error::Rejected(if rej.reason.is_empty() {
                        "상대방이 거부함".into()
                    } else {
                        rej.reason
                    }));
                }
                ControlMessage::Error(info) => return Err(info.into_error()),
                other => {
                    return Err(Error::Protocol(format!(
                        "ACCEPT/REJECT 기대, {} 수신",
                        other.type_name()
                    )))
                }
            }
        }
    }

    /// 데이터 스트림을 열고 워커로 청크를 분배한다
    async fn dispatch_chunks(
        &self,
        target: SocketAddr,
        data_port: u16,
        files: &[OutgoingFile],
        skip: &HashMap<u32, HashSet<u32>>,
        on_progress: Option<OnProgress>,
    ) -> Result<()> {
        // 작업 큐 구성 (이어받기 청크 제외)
        let queue = Arc::new(WorkQueue::new());
        let mut skipped_bytes = 0u64;
        let mut skipped_chunks = 0u32;

        for file in files {
            let total = chunk::chunk_count(file.size, self.config.chunk_size);
            let skip_set = skip.get(&file.id);

            for chunk_id in 0..total {
                let size = chunk::chunk_len(file.size, self.config.chunk_size, chunk_id);
                if skip_set.is_some_and(|s| s.contains(&chunk_id)) {
                    skipped_bytes += size as u64;
                    skipped_chunks += 1;
                    continue;
                }
                queue.push(ChunkWork {
                    file_id: file.id,
                    chunk_id,
                    offset: chunk_id as u64 * self.config.chunk_size as u64,
                    size,
                });
            }
        }

        if skipped_chunks > 0 {
            info!("이어받기로 청크 {skipped_chunks}개({skipped_bytes} bytes) 생략");
            let mut stats = self.stats.lock();
            stats.bytes_transferred += skipped_bytes;
            stats.chunks_completed += skipped_chunks;
        }

        // 데이터 스트림 연결
        let data_addr = SocketAddr::new(
            target.ip(),
            if data_port == 0 { target.port() } else { data_port },
        );
        let mut streams = Vec::with_capacity(self.config.parallel_streams);
        for i in 0..self.config.parallel_streams {
            let stream = tokio::time::timeout(
                Duration::from_millis(CONNECT_TIMEOUT_MS),
                TcpStream::connect(data_addr),
            )
            .await
            .map_err(|_| Error::Timeout(format!("데이터 스트림 {i} 연결 시간 초과")))?
            .map_err(|e| Error::SocketConnect(format!("데이터 스트림 {i}: {e}")))?;

            transfer::tune_data_stream(&stream)?;
            streams.push(stream);
        }
        debug!("데이터 스트림 {}개 연결", streams.len());

        // 워커 분배
        let by_file: Arc<HashMap<u32, OutgoingFile>> =
            Arc::new(files.iter().map(|f| (f.id, f.clone())).collect());
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let mut workers = Vec::new();
        for (worker_id, stream) in streams.into_iter().enumerate() {
            workers.push(tokio::spawn(sender_worker(
                worker_id,
                stream,
                queue.clone(),
                by_file.clone(),
                self.control.clone(),
                self.stats.clone(),
                first_error.clone(),
                on_progress.clone(),
                self.config.chunk_size,
            )));
        }
        for worker in workers {
            let _ = worker.await;
        }

        if let Some(err) = first_error.lock().take() {
            return Err(err);
        }
        if self.control.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

async fn enumerate_files(paths: &[PathBuf]) -> Result<Vec<OutgoingFile>> {
    if paths.is_empty() {
        return Err(Error::InvalidArgument("보낼 파일이 없음".into()));
    }

    let mut files = Vec::with_capacity(paths.len());
    for (idx, path) in paths.iter().enumerate() {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::FileOpen(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(Error::InvalidArgument(format!(
                "{}: 일반 파일이 아님",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidArgument(format!("{}: 파일명 없음", path.display())))?;

        files.push(OutgoingFile {
            id: idx as u32,
            path: path.clone(),
            name,
            size: meta.len(),
        });
    }
    Ok(files)
}

/// 송신 워커: 큐에서 pop한 청크를 자기 스트림으로 보낸다
#[allow(clippy::too_many_arguments)]
async fn sender_worker(
    worker_id: usize,
    mut stream: TcpStream,
    queue: Arc<WorkQueue>,
    files: Arc<HashMap<u32, OutgoingFile>>,
    control: Arc<TransferControl>,
    stats: Arc<Mutex<TransferStats>>,
    first_error: Arc<Mutex<Option<Error>>>,
    on_progress: Option<OnProgress>,
    chunk_size: u32,
) {
    debug!("송신 워커 {worker_id} 시작");
    let mut buf = vec![0u8; chunk_size as usize];

    loop {
        if control.checkpoint().await.is_err() {
            break;
        }
        let Some(work) = queue.pop() else {
            break;
        };

        if let Err(e) = send_chunk(&mut stream, &files, work, &mut buf).await {
            warn!("송신 워커 {worker_id} 에러: {e}");
            {
                let mut slot = first_error.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
            // 세션 전체를 멈춘다. 다른 워커는 다음 체크포인트에서 빠진다.
            control.cancel();
            break;
        }

        let snapshot = {
            let mut stats = stats.lock();
            stats.record_chunk(work.size as u64);
            stats.clone()
        };
        if let Some(on_progress) = &on_progress {
            on_progress(&snapshot);
        }
    }

    debug!("송신 워커 {worker_id} 종료");
}

async fn send_chunk(
    stream: &mut TcpStream,
    files: &HashMap<u32, OutgoingFile>,
    work: ChunkWork,
    buf: &mut [u8],
) -> Result<()> {
    let info = files
        .get(&work.file_id)
        .ok_or_else(|| Error::Internal(format!("작업 항목의 파일 id 불명: {}", work.file_id)))?;

    // 워커마다 독립 핸들을 열어 seek 경합을 피한다
    let mut file = File::open(&info.path)
        .await
        .map_err(|e| Error::FileOpen(format!("{}: {e}", info.path.display())))?;
    file.seek(SeekFrom::Start(work.offset))
        .await
        .map_err(|e| Error::FileRead(e.to_string()))?;

    let data = &mut buf[..work.size as usize];
    file.read_exact(data)
        .await
        .map_err(|e| Error::FileRead(format!("{}: {e}", info.path.display())))?;

    let header = ChunkHeader::new(work.file_id, work.chunk_id, work.offset, work.size);
    transfer::write_all_timeout(stream, &header.encode()).await?;
    transfer::write_all_timeout(stream, data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enumerate_rejects_empty_list() {
        assert!(matches!(
            enumerate_files(&[]).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_enumerate_rejects_missing_file() {
        let paths = vec![PathBuf::from("/nonexistent/teleport-missing.bin")];
        assert!(matches!(
            enumerate_files(&paths).await,
            Err(Error::FileOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_enumerate_assigns_sequential_ids() {
        let dir = std::env::temp_dir().join(format!("teleport-send-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let a = dir.join("a.bin");
        let b = dir.join("b.bin");
        tokio::fs::write(&a, vec![1u8; 100]).await.unwrap();
        tokio::fs::write(&b, vec![2u8; 200]).await.unwrap();

        let files = enumerate_files(&[a, b]).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].id, 0);
        assert_eq!(files[0].name, "a.bin");
        assert_eq!(files[0].size, 100);
        assert_eq!(files[1].id, 1);
        assert_eq!(files[1].size, 200);
    }

    #[tokio::test]
    async fn test_connect_refused_is_socket_error() {
        let session = SenderSession::new(Config::default());
        let dir = std::env::temp_dir().join(format!("teleport-send-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("x.bin");
        tokio::fs::write(&path, b"data").await.unwrap();

        // 닫힌 포트로 연결
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = session.run(target, vec![path], None).await;
        assert!(matches!(
            result,
            Err(Error::SocketConnect(_)) | Err(Error::Timeout(_))
        ));
        assert_eq!(*session.state_handle().lock(), TransferState::Failed);
    }
}
