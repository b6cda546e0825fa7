//! 수신 엔진
//!
//! 컨트롤 서버 수락 루프와 세션 처리, 병렬 수신 파이프라인.
//!
//! 세션 하나의 흐름: HANDSHAKE 검증 → HANDSHAKE_ACK(세션 토큰) →
//! FILE_LIST → 수락 콜백 → RESUME_REQUEST* → ACCEPT(데이터 포트) →
//! START → 데이터 스트림 N개 수락, 워커가 청크를 순서 무관 기록 →
//! 전 파일 완료 시 COMPLETE.
//!
//! 수신 파일명은 반드시 살균을 거치고, 부분 수신 상태는 세션이
//! 어떻게 끝나든 이어받기 저장소에 남는다.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::{self, ChunkHeader, ChunkTracker};
use crate::config::Config;
use crate::device::{DeviceRegistry, OsType};
use crate::message::{
    self, AcceptReject, Complete, ControlMessage, DeviceInfo, ErrorInfo, FileEntry, Handshake,
    ResumeRequest,
};
use crate::resume::{ResumeState, ResumeStore, DEFAULT_MAX_AGE_SECS};
use crate::sanitize::{sanitize_device_name, sanitize_filename};
use crate::stats::TransferStats;
use crate::transfer::{
    self, OnComplete, OnProgress, TransferControl, TransferState, HANDSHAKE_TIMEOUT_MS,
    SOCKET_TIMEOUT_MS,
};
use crate::{net, Error, Result, MAX_TOTAL_SIZE, PROTOCOL_VERSION};

/// 수신 문의 콜백. true면 수락.
pub type OnIncoming = Arc<dyn Fn(&IncomingTransfer) -> bool + Send + Sync>;

/// 수신 문의 정보
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    /// 송신 장치 표시 이름 (살균 후)
    pub sender_name: String,
    pub sender_os: OsType,
    pub sender_ip: Ipv4Addr,
    /// 디스커버리 레지스트리에서 식별된 장치 id
    pub sender_id: Option<String>,
    pub files: Vec<FileEntry>,
    pub total_size: u64,
}

/// 진행 중 세션 참조 (엔진 종료 시 일괄 취소용)
struct ActiveSession {
    control: Arc<TransferControl>,
    state: Arc<Mutex<TransferState>>,
}

struct ReceiverShared {
    config: Config,
    registry: Arc<DeviceRegistry>,
    listener: Arc<TcpListener>,
    output_dir: PathBuf,
    resume_store: Arc<ResumeStore>,
    running: Arc<AtomicBool>,
    sessions: DashMap<u64, ActiveSession>,
    next_session: AtomicU64,
    on_incoming: OnIncoming,
    on_progress: Option<OnProgress>,
    on_complete: Option<OnComplete>,
}

/// 수신 엔진: 컨트롤 서버와 세션 수명 관리
pub struct Receiver {
    shared: Arc<ReceiverShared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    pub fn new(
        config: Config,
        registry: Arc<DeviceRegistry>,
        listener: Arc<TcpListener>,
        output_dir: PathBuf,
        on_incoming: OnIncoming,
        on_progress: Option<OnProgress>,
        on_complete: Option<OnComplete>,
    ) -> Result<Self> {
        let resume_store = Arc::new(ResumeStore::new(config.resume_dir.clone())?);
        // 시작할 때 묵은 상태를 정리한다
        resume_store.cleanup(DEFAULT_MAX_AGE_SECS);

        Ok(Self {
            shared: Arc::new(ReceiverShared {
                config,
                registry,
                listener,
                output_dir,
                resume_store,
                running: Arc::new(AtomicBool::new(false)),
                sessions: DashMap::new(),
                next_session: AtomicU64::new(0),
                on_incoming,
                on_progress,
                on_complete,
            }),
            accept_task: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// 수락 루프 시작
    pub fn start(&self) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            while shared.running.load(Ordering::SeqCst) {
                let accepted = tokio::time::timeout(
                    Duration::from_millis(500),
                    shared.listener.accept(),
                )
                .await;

                match accepted {
                    Ok(Ok((stream, peer))) => {
                        info!("Incoming connection from {peer}");
                        let shared = shared.clone();
                        tokio::spawn(handle_connection(shared, stream, peer));
                    }
                    Ok(Err(e)) => warn!("수락 실패: {e}"),
                    Err(_) => {} // 타임아웃, 정지 플래그 확인 후 계속
                }
            }
        });

        *self.accept_task.lock() = Some(task);
        info!("Control server accepting");
        Ok(())
    }

    /// 진행 중 세션 전부에 취소를 건다
    pub fn cancel_active(&self) {
        for entry in self.shared.sessions.iter() {
            entry.value().control.cancel();
        }
    }

    /// Transferring/Paused 상태의 세션이 남아 있는지
    pub fn has_active_transfer(&self) -> bool {
        self.shared.sessions.iter().any(|entry| {
            matches!(
                *entry.value().state.lock(),
                TransferState::Transferring | TransferState::Paused
            )
        })
    }

    /// 수락 루프 정지. 멱등.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Control server stopped");
    }
}

/// 세션 하나를 끝까지 처리하고 결과를 통지한다
async fn handle_connection(shared: Arc<ReceiverShared>, stream: TcpStream, peer: SocketAddr) {
    let peer_ip = match peer {
        SocketAddr::V4(a) => *a.ip(),
        SocketAddr::V6(_) => {
            warn!("IPv6 연결은 받지 않음: {peer}");
            return;
        }
    };

    let control = Arc::new(TransferControl::new());
    let state = Arc::new(Mutex::new(TransferState::Handshaking));
    let session_id = shared.next_session.fetch_add(1, Ordering::SeqCst);
    shared.sessions.insert(
        session_id,
        ActiveSession {
            control: control.clone(),
            state: state.clone(),
        },
    );

    let (mut reader, mut writer) = stream.into_split();
    let result = run_session(&shared, &control, &state, &mut reader, &mut writer, peer_ip).await;

    match &result {
        Ok(stats) => {
            *state.lock() = TransferState::Complete;
            info!(
                "Transfer complete: {} files, {} bytes",
                stats.files_completed, stats.bytes_transferred
            );
        }
        Err(Error::Cancelled) => {
            *state.lock() = TransferState::Cancelled;
            // 부분 파일과 이어받기 상태는 그대로 둔다
            let notice = ControlMessage::Complete(Complete {
                success: false,
                message: "cancelled".into(),
                files_transferred: 0,
                bytes_transferred: 0,
            });
            let _ = message::write_message(&mut writer, &notice).await;
        }
        Err(Error::Rejected(_)) => {
            // REJECT 프레임은 이미 나갔다
            *state.lock() = TransferState::Failed;
        }
        Err(e) => {
            *state.lock() = TransferState::Failed;
            warn!("수신 세션 실패: {e}");
            let notice = if e.is_fatal() {
                ControlMessage::Error(ErrorInfo::from_error(e, true))
            } else {
                ControlMessage::Complete(Complete {
                    success: false,
                    message: e.to_string(),
                    files_transferred: 0,
                    bytes_transferred: 0,
                })
            };
            let _ = message::write_message(&mut writer, &notice).await;
        }
    }

    shared.sessions.remove(&session_id);
    if let Some(on_complete) = &shared.on_complete {
        on_complete(&result);
    }
}

async fn run_session(
    shared: &Arc<ReceiverShared>,
    control: &Arc<TransferControl>,
    state: &Arc<Mutex<TransferState>>,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    peer_ip: Ipv4Addr,
) -> Result<TransferStats> {
    // HANDSHAKE
    let handshake = match message::read_message_timeout(reader, HANDSHAKE_TIMEOUT_MS).await? {
        ControlMessage::Handshake(h) => h,
        other => {
            return Err(Error::Protocol(format!(
                "HANDSHAKE 기대, {} 수신",
                other.type_name()
            )))
        }
    };

    if handshake.protocol_version != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "프로토콜 버전 불일치: {}",
            handshake.protocol_version
        )));
    }

    let session_token = net::generate_session_token();
    let ack = ControlMessage::HandshakeAck(Handshake {
        protocol_version: PROTOCOL_VERSION,
        device: DeviceInfo {
            name: shared.config.device_name.clone(),
            os: OsType::current().as_str().to_string(),
        },
        session_token: Some(session_token.clone()),
    });
    message::write_message(writer, &ack).await?;
    info!("Handshake complete with {}", handshake.device.name);

    // FILE_LIST
    let list = match message::read_message_timeout(reader, SOCKET_TIMEOUT_MS).await? {
        ControlMessage::FileList(l) => l,
        other => {
            return Err(Error::Protocol(format!(
                "FILE_LIST 기대, {} 수신",
                other.type_name()
            )))
        }
    };
    if list.files.is_empty() {
        return Err(Error::Protocol("빈 파일 목록".into()));
    }

    let actual_total: u64 = list.files.iter().map(|f| f.size).sum();
    if actual_total > MAX_TOTAL_SIZE {
        let reject = ControlMessage::Reject(AcceptReject {
            accepted: false,
            reason: "전송 크기 한도 초과".into(),
            data_port: 0,
        });
        message::write_message(writer, &reject).await?;
        return Err(Error::Rejected("전송 크기 한도 초과".into()));
    }

    // 송신자 식별: 레지스트리의 장치 id 우선, 없으면 핸드쉐이크 이름
    let registered = shared.registry.get_by_ip(peer_ip);
    let sender_key = registered
        .as_ref()
        .map(|d| d.id.clone())
        .unwrap_or_else(|| handshake.device.name.clone());

    let incoming = IncomingTransfer {
        sender_name: sanitize_device_name(&handshake.device.name),
        sender_os: OsType::parse(&handshake.device.os),
        sender_ip: peer_ip,
        sender_id: registered.map(|d| d.id),
        files: list.files.clone(),
        total_size: if list.total_size != 0 {
            list.total_size
        } else {
            actual_total
        },
    };

    // 수락 판단
    if !(shared.on_incoming)(&incoming) {
        let reject = ControlMessage::Reject(AcceptReject {
            accepted: false,
            reason: "User declined".into(),
            data_port: 0,
        });
        message::write_message(writer, &reject).await?;
        info!("Transfer rejected by user");
        return Err(Error::Rejected("User declined".into()));
    }

    // 이어받기 상태 통지. ACCEPT가 이 열의 끝을 표시한다.
    let mut seeds: HashMap<u32, Vec<u32>> = HashMap::new();
    for file in &list.files {
        let Some(saved) = shared.resume_store.load(&file.name, &sender_key) else {
            continue;
        };
        // 크기나 청크 격자가 다르면 이전 상태는 쓸 수 없다
        if saved.file_size != file.size || saved.chunk_size != shared.config.chunk_size {
            continue;
        }

        let received_bytes: u64 = saved
            .received_chunks
            .iter()
            .map(|&c| chunk::chunk_len(file.size, saved.chunk_size, c) as u64)
            .sum();
        let request = ControlMessage::ResumeRequest(ResumeRequest {
            file_id: file.id,
            received_chunks: saved.received_chunks.clone(),
            received_bytes,
        });
        message::write_message(writer, &request).await?;
        info!(
            "이어받기: {} ({}/{} 청크 보유)",
            file.name,
            saved.received_chunks.len(),
            saved.total_chunks
        );
        seeds.insert(file.id, saved.received_chunks);
    }

    // 세션 전용 데이터 리스너를 열고 실제 포트를 광고한다
    let data_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| Error::SocketBind(e.to_string()))?;
    let data_port = data_listener
        .local_addr()
        .map_err(|e| Error::SocketBind(e.to_string()))?
        .port();

    let accept = ControlMessage::Accept(AcceptReject {
        accepted: true,
        reason: String::new(),
        data_port,
    });
    message::write_message(writer, &accept).await?;
    info!("Transfer accepted, data port {data_port}");

    // START
    match message::read_message_timeout(reader, SOCKET_TIMEOUT_MS).await? {
        ControlMessage::Start {} => {}
        ControlMessage::Cancel(_) => return Err(Error::Cancelled),
        other => {
            return Err(Error::Protocol(format!(
                "START 기대, {} 수신",
                other.type_name()
            )))
        }
    }

    *state.lock() = TransferState::Transferring;
    let stats = receive_files(
        shared,
        control,
        reader,
        data_listener,
        &list.files,
        &seeds,
        &sender_key,
        &session_token,
    )
    .await?;
    *state.lock() = TransferState::Completing;

    // 완료 통지
    let complete = ControlMessage::Complete(Complete {
        success: true,
        message: String::new(),
        files_transferred: stats.files_completed,
        bytes_transferred: stats.bytes_transferred,
    });
    message::write_message(writer, &complete).await?;

    Ok(stats)
}

/// 수신 파일 슬롯: 출력 핸들 + 청크 비트맵
struct FileSlot {
    info: FileEntry,
    out_name: String,
    /// seek+write 원자성을 지키는 파일 뮤텍스
    file: tokio::sync::Mutex<File>,
    tracker: Mutex<ChunkTracker>,
}

#[allow(clippy::too_many_arguments)]
async fn receive_files(
    shared: &Arc<ReceiverShared>,
    control: &Arc<TransferControl>,
    reader: &mut OwnedReadHalf,
    data_listener: TcpListener,
    files: &[FileEntry],
    seeds: &HashMap<u32, Vec<u32>>,
    sender_key: &str,
    session_token: &str,
) -> Result<TransferStats> {
    let chunk_size = shared.config.chunk_size;

    tokio::fs::create_dir_all(&shared.output_dir)
        .await
        .map_err(|e| Error::FileOpen(format!("{}: {e}", shared.output_dir.display())))?;

    // 슬롯 구성: 살균된 이름으로 열고 최종 크기로 미리 늘린다
    let stats = Arc::new(Mutex::new(TransferStats::new()));
    {
        let mut s = stats.lock();
        s.files_total = files.len() as u32;
        s.bytes_total = files.iter().map(|f| f.size).sum();
        s.chunks_total = files
            .iter()
            .map(|f| chunk::chunk_count(f.size, chunk_size))
            .sum();
    }

    let mut slots: HashMap<u32, Arc<FileSlot>> = HashMap::new();
    let mut incomplete = 0u32;

    for info in files {
        let mut safe = sanitize_filename(&info.name);
        if safe == "unnamed" {
            safe = format!("file_{}", info.id);
        }
        if safe != info.name {
            warn!("파일명 살균: '{}' → '{}'", info.name, safe);
        }

        let out_path = shared.output_dir.join(&safe);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&out_path)
            .await
            .map_err(|e| Error::FileOpen(format!("{}: {e}", out_path.display())))?;
        // 임의 오프셋 쓰기가 파일을 늘리지 않도록 미리 크기를 맞춘다
        file.set_len(info.size)
            .await
            .map_err(|e| Error::FileWrite(format!("{}: {e}", out_path.display())))?;

        let mut tracker = ChunkTracker::new(chunk::chunk_count(info.size, chunk_size));
        if let Some(seed) = seeds.get(&info.id) {
            tracker.seed(seed);

            let resumed_bytes: u64 = tracker
                .received_ids()
                .iter()
                .map(|&c| chunk::chunk_len(info.size, chunk_size, c) as u64)
                .sum();
            let mut s = stats.lock();
            s.bytes_transferred += resumed_bytes;
            s.chunks_completed += tracker.received_count();
        }

        if tracker.is_complete() {
            stats.lock().files_completed += 1;
        } else {
            incomplete += 1;
        }

        slots.insert(
            info.id,
            Arc::new(FileSlot {
                info: info.clone(),
                out_name: safe,
                file: tokio::sync::Mutex::new(file),
                tracker: Mutex::new(tracker),
            }),
        );

        debug!(
            "Receiving: {} ({} bytes, {} chunks)",
            info.name,
            info.size,
            chunk::chunk_count(info.size, chunk_size)
        );
    }

    let slots = Arc::new(slots);

    if incomplete > 0 {
        // 데이터 스트림 수락
        let mut streams = Vec::with_capacity(shared.config.parallel_streams);
        for i in 0..shared.config.parallel_streams {
            let (stream, _) = tokio::time::timeout(
                Duration::from_millis(SOCKET_TIMEOUT_MS),
                data_listener.accept(),
            )
            .await
            .map_err(|_| Error::Timeout(format!("데이터 스트림 {i} 수락 시간 초과")))?
            .map_err(|e| Error::SocketRecv(e.to_string()))?;

            transfer::tune_data_stream(&stream)?;
            streams.push(stream);
        }
        debug!("데이터 스트림 {}개 수락", streams.len());

        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));
        let files_remaining = Arc::new(AtomicU32::new(incomplete));

        let mut workers = Vec::new();
        for (worker_id, stream) in streams.into_iter().enumerate() {
            workers.push(tokio::spawn(receiver_worker(WorkerCtx {
                worker_id,
                stream,
                slots: slots.clone(),
                control: control.clone(),
                stats: stats.clone(),
                first_error: first_error.clone(),
                on_progress: shared.on_progress.clone(),
                resume_store: shared.resume_store.clone(),
                sender_key: sender_key.to_string(),
                session_token: session_token.to_string(),
                chunk_size,
                done: done.clone(),
                files_remaining: files_remaining.clone(),
            })));
        }

        // 워커를 기다리면서 컨트롤 채널도 살핀다.
        // CANCEL 프레임과 소켓 종료는 같은 취소다.
        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        tokio::pin!(join_all);

        loop {
            tokio::select! {
                _ = &mut join_all => break,
                msg = message::read_message(reader) => match msg {
                    Ok(ControlMessage::Cancel(_)) => {
                        info!("송신측 취소 수신");
                        control.cancel();
                    }
                    Ok(other) => debug!("전송 중 컨트롤 메시지 무시: {}", other.type_name()),
                    Err(_) => {
                        // 컨트롤 채널이 닫힘. 세션이 끝났다면 조인만 기다린다.
                        (&mut join_all).await;
                        break;
                    }
                },
            }
        }

        if let Some(err) = first_error.lock().take() {
            return Err(err);
        }
        if control.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let all_complete = slots.values().all(|slot| slot.tracker.lock().is_complete());
        if !all_complete {
            // 스트림이 닫혔는데 덜 받았다. 부분 상태는 이어받기용으로 남는다.
            return Err(Error::ConnectionClosed);
        }
    }

    // 마무리: flush, 이어받기 상태 정리
    for slot in slots.values() {
        let mut file = slot.file.lock().await;
        file.flush()
            .await
            .map_err(|e| Error::FileWrite(format!("{}: {e}", slot.out_name)))?;
        shared.resume_store.clear(&slot.info.name, sender_key);
    }

    let snapshot = {
        let mut s = stats.lock();
        s.refresh_rate();
        s.clone()
    };
    Ok(snapshot)
}

struct WorkerCtx {
    worker_id: usize,
    stream: TcpStream,
    slots: Arc<HashMap<u32, Arc<FileSlot>>>,
    control: Arc<TransferControl>,
    stats: Arc<Mutex<TransferStats>>,
    first_error: Arc<Mutex<Option<Error>>>,
    on_progress: Option<OnProgress>,
    resume_store: Arc<ResumeStore>,
    sender_key: String,
    session_token: String,
    chunk_size: u32,
    done: Arc<AtomicBool>,
    files_remaining: Arc<AtomicU32>,
}

/// 수신 워커: 헤더 + 본문을 읽어 제 오프셋에 기록한다
async fn receiver_worker(mut ctx: WorkerCtx) {
    debug!("수신 워커 {} 시작", ctx.worker_id);
    let mut buf = vec![0u8; ctx.chunk_size as usize];

    loop {
        if ctx.done.load(Ordering::SeqCst) || ctx.control.is_cancelled() {
            break;
        }

        // 헤더. 스트림 종료와 대기 타임아웃은 에러가 아니라 이 스트림의 끝이다.
        let mut header_buf = [0u8; chunk::HEADER_SIZE];
        match transfer::read_exact_timeout(&mut ctx.stream, &mut header_buf).await {
            Ok(()) => {}
            Err(Error::ConnectionClosed) | Err(Error::Timeout(_)) => break,
            Err(e) => {
                fail_session(&ctx, e);
                break;
            }
        }
        let header = ChunkHeader::decode(&header_buf);

        if let Err(e) = receive_chunk(&mut ctx, header, &mut buf).await {
            fail_session(&ctx, e);
            break;
        }
    }

    debug!("수신 워커 {} 종료", ctx.worker_id);
}

fn fail_session(ctx: &WorkerCtx, e: Error) {
    warn!("수신 워커 {} 에러: {e}", ctx.worker_id);
    {
        let mut slot = ctx.first_error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }
    ctx.control.cancel();
}

async fn receive_chunk(ctx: &mut WorkerCtx, header: ChunkHeader, buf: &mut [u8]) -> Result<()> {
    let slot = ctx
        .slots
        .get(&header.file_id)
        .ok_or_else(|| Error::Protocol(format!("청크의 파일 id 불명: {}", header.file_id)))?
        .clone();

    header.validate(ctx.chunk_size, slot.info.size)?;

    // 본문. 헤더 뒤에 끊기는 것은 항상 에러다.
    let data = &mut buf[..header.size as usize];
    transfer::read_exact_timeout(&mut ctx.stream, data).await?;

    // 파일 뮤텍스가 seek+write 원자성을 보장한다
    let offset = header.chunk_id as u64 * ctx.chunk_size as u64;
    {
        let mut file = slot.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::FileWrite(format!("{}: {e}", slot.out_name)))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::FileWrite(format!("{}: {e}", slot.out_name)))?;
    }

    // 비트맵 갱신. 중복 청크는 통계에 세지 않는다.
    let (newly, received_ids, file_complete) = {
        let mut tracker = slot.tracker.lock();
        let newly = tracker.mark_received(header.chunk_id);
        let ids = if newly { tracker.received_ids() } else { Vec::new() };
        (newly, ids, tracker.is_complete())
    };

    if !newly {
        return Ok(());
    }

    // 이어받기 상태 갱신. 저장 실패는 세션을 죽일 일이 아니다.
    let resume_state = ResumeState {
        file_name: slot.info.name.clone(),
        file_size: slot.info.size,
        file_id: slot.info.id,
        chunk_size: ctx.chunk_size,
        total_chunks: chunk::chunk_count(slot.info.size, ctx.chunk_size),
        received_chunks: received_ids,
        sender_id: ctx.sender_key.clone(),
        session_token: ctx.session_token.clone(),
        timestamp: 0,
    };
    if let Err(e) = ctx.resume_store.save(&resume_state) {
        warn!("이어받기 상태 저장 실패: {e}");
    }

    let snapshot = {
        let mut stats = ctx.stats.lock();
        stats.record_chunk(header.size as u64);
        if file_complete {
            stats.files_completed += 1;
        }
        stats.clone()
    };

    if file_complete {
        info!("Received: {}", slot.out_name);
        if ctx.files_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            ctx.done.store(true, Ordering::SeqCst);
        }
    }

    if let Some(on_progress) = &ctx.on_progress {
        on_progress(&snapshot);
    }

    Ok(())
}
