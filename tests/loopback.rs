//! 루프백 종단 간 전송 시나리오
//!
//! 엔진 두 개를 한 프로세스에 띄워 127.0.0.1로 실제 전송을 돌린다.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use teleport::chunk::ChunkHeader;
use teleport::engine::{Engine, IncomingTransfer};
use teleport::message::{
    self, ControlMessage, DeviceInfo, FileEntry, FileList, Handshake,
};
use teleport::resume::{ResumeState, ResumeStore};
use teleport::{Config, Result, TransferState, TransferStats};

fn unique_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("teleport-{tag}-{}", uuid::Uuid::new_v4()))
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

fn test_config(name: &str, chunk_size: u32, streams: usize) -> Config {
    Config {
        device_name: name.to_string(),
        chunk_size,
        parallel_streams: streams,
        download_dir: unique_dir("down"),
        resume_dir: unique_dir("resume"),
        ..Config::default()
    }
}

async fn wait_for(flag: &AtomicBool, timeout: Duration) -> bool {
    let mut waited = Duration::ZERO;
    while waited < timeout {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    flag.load(Ordering::SeqCst)
}

/// S1: 1 MiB를 4스트림 x 256 KiB 청크로 왕복, 바이트 동일성 확인
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_trip_one_mib() {
    let source = patterned(1_048_576);

    let src_dir = unique_dir("src");
    tokio::fs::create_dir_all(&src_dir).await.unwrap();
    let src_path = src_dir.join("a.bin");
    tokio::fs::write(&src_path, &source).await.unwrap();

    let out_dir = unique_dir("out");
    let recv_engine = Engine::new(test_config("receiver", 262_144, 4)).unwrap();
    let recv_done = Arc::new(AtomicBool::new(false));
    {
        let recv_done = recv_done.clone();
        recv_engine
            .start_receiving(
                Some(out_dir.clone()),
                Arc::new(|_: &IncomingTransfer| true),
                None,
                Some(Arc::new(move |result: &Result<TransferStats>| {
                    assert!(result.is_ok(), "수신 실패: {result:?}");
                    recv_done.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    let send_engine = Engine::new(test_config("sender", 262_144, 4)).unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", recv_engine.control_port())
        .parse()
        .unwrap();

    let handle = send_engine
        .send_files_to(target, vec![src_path], None, None)
        .unwrap();
    handle.wait().await;

    assert_eq!(handle.state(), TransferState::Complete);
    let stats = handle.stats();
    assert_eq!(stats.bytes_transferred, 1_048_576);
    assert_eq!(stats.chunks_total, 4);
    assert_eq!(stats.files_completed, 1);

    assert!(wait_for(&recv_done, Duration::from_secs(5)).await);

    let received = tokio::fs::read(out_dir.join("a.bin")).await.unwrap();
    assert_eq!(received.len(), source.len());
    assert_eq!(received, source, "수신 파일이 원본과 다름");

    send_engine.shutdown().await;
    recv_engine.shutdown().await;
}

/// S2: 프로토콜 버전 불일치는 ERROR{code:-11, fatal} 후 종료
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protocol_version_rejected() {
    let recv_engine = Engine::new(test_config("receiver", 262_144, 1)).unwrap();
    recv_engine
        .start_receiving(None, Arc::new(|_: &IncomingTransfer| true), None, None)
        .unwrap();

    let target: SocketAddr = format!("127.0.0.1:{}", recv_engine.control_port())
        .parse()
        .unwrap();
    let mut stream = TcpStream::connect(target).await.unwrap();

    let bad = ControlMessage::Handshake(Handshake {
        protocol_version: 99,
        device: DeviceInfo {
            name: "S".into(),
            os: "Linux".into(),
        },
        session_token: None,
    });
    message::write_message(&mut stream, &bad).await.unwrap();

    match message::read_message_timeout(&mut stream, 5_000).await.unwrap() {
        ControlMessage::Error(info) => {
            assert_eq!(info.code, -11);
            assert!(info.fatal);
        }
        other => panic!("ERROR 기대, {} 수신", other.type_name()),
    }

    recv_engine.shutdown().await;
}

/// S3: 경로 탈출 파일명은 살균된 이름으로만 기록된다
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn path_traversal_neutralized() {
    let out_dir = unique_dir("out");
    let recv_engine = Engine::new(test_config("receiver", 4_096, 1)).unwrap();
    let recv_done = Arc::new(AtomicBool::new(false));
    {
        let recv_done = recv_done.clone();
        recv_engine
            .start_receiving(
                Some(out_dir.clone()),
                Arc::new(|_: &IncomingTransfer| true),
                None,
                Some(Arc::new(move |_: &Result<TransferStats>| {
                    recv_done.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    let target: SocketAddr = format!("127.0.0.1:{}", recv_engine.control_port())
        .parse()
        .unwrap();
    let mut control = TcpStream::connect(target).await.unwrap();

    // 수동 클라이언트로 세션을 걷는다
    let handshake = ControlMessage::Handshake(Handshake {
        protocol_version: 1,
        device: DeviceInfo {
            name: "raw-sender".into(),
            os: "Linux".into(),
        },
        session_token: None,
    });
    message::write_message(&mut control, &handshake).await.unwrap();
    let ack = message::read_message_timeout(&mut control, 5_000).await.unwrap();
    assert!(matches!(ack, ControlMessage::HandshakeAck(_)));

    let payload = b"secret payload".to_vec();
    let list = ControlMessage::FileList(FileList {
        files: vec![FileEntry {
            id: 0,
            name: "../../etc/passwd".into(),
            size: payload.len() as u64,
        }],
        total_size: payload.len() as u64,
    });
    message::write_message(&mut control, &list).await.unwrap();

    // RESUME_REQUEST 없이 바로 ACCEPT가 와야 한다
    let data_port = match message::read_message_timeout(&mut control, 5_000).await.unwrap() {
        ControlMessage::Accept(acc) => {
            assert!(acc.accepted);
            acc.data_port
        }
        other => panic!("ACCEPT 기대, {} 수신", other.type_name()),
    };

    message::write_message(&mut control, &ControlMessage::Start {})
        .await
        .unwrap();

    let data_addr: SocketAddr = format!("127.0.0.1:{data_port}").parse().unwrap();
    let mut data = TcpStream::connect(data_addr).await.unwrap();
    let header = ChunkHeader::new(0, 0, 0, payload.len() as u32);
    data.write_all(&header.encode()).await.unwrap();
    data.write_all(&payload).await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);

    match message::read_message_timeout(&mut control, 5_000).await.unwrap() {
        ControlMessage::Complete(done) => {
            assert!(done.success);
            assert_eq!(done.files_transferred, 1);
            assert_eq!(done.bytes_transferred, payload.len() as u64);
        }
        other => panic!("COMPLETE 기대, {} 수신", other.type_name()),
    }

    assert!(wait_for(&recv_done, Duration::from_secs(5)).await);

    // 살균된 경로에만 존재해야 한다
    let sanitized = out_dir.join("etc_passwd");
    let written = tokio::fs::read(&sanitized).await.unwrap();
    assert_eq!(written, payload);
    assert!(!out_dir.join("passwd").exists());

    recv_engine.shutdown().await;
}

/// S4: 보존된 청크 비트맵이 시드되고 빠진 청크만 받아 완성된다
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_skips_received_chunks() {
    const CHUNK: u32 = 4_096;
    const TOTAL_CHUNKS: u32 = 10;
    let source = patterned((CHUNK * TOTAL_CHUNKS) as usize);

    let src_dir = unique_dir("src");
    tokio::fs::create_dir_all(&src_dir).await.unwrap();
    let src_path = src_dir.join("m.bin");
    tokio::fs::write(&src_path, &source).await.unwrap();

    let out_dir = unique_dir("out");
    tokio::fs::create_dir_all(&out_dir).await.unwrap();
    let resume_dir = unique_dir("resume");

    // 이전 세션이 남긴 것처럼 부분 파일과 상태를 꾸민다.
    // 송신자 이름이 이어받기 키가 된다 (레지스트리 없이 연결할 때).
    let have: Vec<u32> = vec![0, 1, 2, 5, 7];
    let mut partial = vec![0u8; source.len()];
    for &chunk_id in &have {
        let start = (chunk_id * CHUNK) as usize;
        let end = start + CHUNK as usize;
        partial[start..end].copy_from_slice(&source[start..end]);
    }
    tokio::fs::write(out_dir.join("m.bin"), &partial).await.unwrap();

    let store = ResumeStore::new(resume_dir.clone()).unwrap();
    store
        .save(&ResumeState {
            file_name: "m.bin".into(),
            file_size: source.len() as u64,
            file_id: 0,
            chunk_size: CHUNK,
            total_chunks: TOTAL_CHUNKS,
            received_chunks: have.clone(),
            sender_id: "sender-123".into(),
            session_token: "cafebabecafebabecafebabecafebabe".into(),
            timestamp: 0,
        })
        .unwrap();

    let recv_config = Config {
        resume_dir: resume_dir.clone(),
        ..test_config("receiver", CHUNK, 2)
    };
    let recv_engine = Engine::new(recv_config).unwrap();

    let recv_done = Arc::new(AtomicBool::new(false));
    let fresh_chunks = Arc::new(AtomicU32::new(0));
    {
        let recv_done = recv_done.clone();
        let fresh_chunks = fresh_chunks.clone();
        recv_engine
            .start_receiving(
                Some(out_dir.clone()),
                Arc::new(|_: &IncomingTransfer| true),
                // 진행 콜백은 새로 기록된 청크마다 한 번 불린다
                Some(Arc::new(move |_: &TransferStats| {
                    fresh_chunks.fetch_add(1, Ordering::SeqCst);
                })),
                Some(Arc::new(move |result: &Result<TransferStats>| {
                    assert!(result.is_ok(), "수신 실패: {result:?}");
                    recv_done.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    let send_engine = Engine::new(test_config("sender-123", CHUNK, 2)).unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", recv_engine.control_port())
        .parse()
        .unwrap();
    let handle = send_engine
        .send_files_to(target, vec![src_path], None, None)
        .unwrap();
    handle.wait().await;
    assert_eq!(handle.state(), TransferState::Complete);

    assert!(wait_for(&recv_done, Duration::from_secs(5)).await);

    // 빠진 5개 청크만 새로 전송됐다
    assert_eq!(fresh_chunks.load(Ordering::SeqCst), 5);

    let received = tokio::fs::read(out_dir.join("m.bin")).await.unwrap();
    assert_eq!(received, source, "이어받기 후 파일이 원본과 다름");

    // 성공한 전송의 이어받기 상태는 정리된다
    let store = ResumeStore::new(resume_dir).unwrap();
    assert!(store.load("m.bin", "sender-123").is_none());

    send_engine.shutdown().await;
    recv_engine.shutdown().await;
}

/// 수신자가 거부하면 송신은 Rejected로 끝난다
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejection_surfaces_to_sender() {
    let recv_engine = Engine::new(test_config("receiver", 4_096, 1)).unwrap();
    recv_engine
        .start_receiving(None, Arc::new(|_: &IncomingTransfer| false), None, None)
        .unwrap();

    let src_dir = unique_dir("src");
    tokio::fs::create_dir_all(&src_dir).await.unwrap();
    let src_path = src_dir.join("x.bin");
    tokio::fs::write(&src_path, patterned(1000)).await.unwrap();

    let send_engine = Engine::new(test_config("sender", 4_096, 1)).unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", recv_engine.control_port())
        .parse()
        .unwrap();

    let rejected = Arc::new(AtomicBool::new(false));
    let handle = {
        let rejected = rejected.clone();
        send_engine
            .send_files_to(
                target,
                vec![src_path],
                None,
                Some(Arc::new(move |result: &Result<TransferStats>| {
                    if matches!(result, Err(teleport::Error::Rejected(_))) {
                        rejected.store(true, Ordering::SeqCst);
                    }
                })),
            )
            .unwrap()
    };
    handle.wait().await;

    assert_eq!(handle.state(), TransferState::Failed);
    assert!(rejected.load(Ordering::SeqCst), "Rejected 에러가 전달되지 않음");

    send_engine.shutdown().await;
    recv_engine.shutdown().await;
}

/// 수신 중복 시작은 AlreadyRunning
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn double_start_receiving_fails() {
    let engine = Engine::new(test_config("receiver", 4_096, 1)).unwrap();
    engine
        .start_receiving(None, Arc::new(|_: &IncomingTransfer| true), None, None)
        .unwrap();

    let result = engine.start_receiving(None, Arc::new(|_: &IncomingTransfer| true), None, None);
    assert!(matches!(result, Err(teleport::Error::AlreadyRunning)));

    engine.shutdown().await;
}

/// 파일 여러 개 (0바이트 포함)를 한 세션으로 전송
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_file_session_with_empty_file() {
    const CHUNK: u32 = 8_192;
    let big = patterned(3 * CHUNK as usize + 100);
    let small = patterned(64);

    let src_dir = unique_dir("src");
    tokio::fs::create_dir_all(&src_dir).await.unwrap();
    let big_path = src_dir.join("big.bin");
    let small_path = src_dir.join("small.bin");
    let empty_path = src_dir.join("empty.bin");
    tokio::fs::write(&big_path, &big).await.unwrap();
    tokio::fs::write(&small_path, &small).await.unwrap();
    tokio::fs::write(&empty_path, b"").await.unwrap();

    let out_dir = unique_dir("out");
    let recv_engine = Engine::new(test_config("receiver", CHUNK, 2)).unwrap();
    let recv_done = Arc::new(AtomicBool::new(false));
    {
        let recv_done = recv_done.clone();
        recv_engine
            .start_receiving(
                Some(out_dir.clone()),
                Arc::new(|_: &IncomingTransfer| true),
                None,
                Some(Arc::new(move |result: &Result<TransferStats>| {
                    assert!(result.is_ok(), "수신 실패: {result:?}");
                    recv_done.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    let send_engine = Engine::new(test_config("sender", CHUNK, 2)).unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", recv_engine.control_port())
        .parse()
        .unwrap();

    let handle = send_engine
        .send_files_to(target, vec![big_path, small_path, empty_path], None, None)
        .unwrap();
    handle.wait().await;
    assert_eq!(handle.state(), TransferState::Complete);

    let stats = handle.stats();
    assert_eq!(stats.files_total, 3);
    assert_eq!(stats.files_completed, 3);
    assert_eq!(stats.bytes_transferred, (big.len() + small.len()) as u64);

    assert!(wait_for(&recv_done, Duration::from_secs(5)).await);

    assert_eq!(tokio::fs::read(out_dir.join("big.bin")).await.unwrap(), big);
    assert_eq!(
        tokio::fs::read(out_dir.join("small.bin")).await.unwrap(),
        small
    );
    assert_eq!(
        tokio::fs::read(out_dir.join("empty.bin")).await.unwrap().len(),
        0
    );

    send_engine.shutdown().await;
    recv_engine.shutdown().await;
}

/// 빠른 폴링 대기 (일시정지/취소가 전송 중에 걸리도록)
async fn wait_for_fast(flag: &AtomicBool, timeout: Duration) -> bool {
    let mut waited = Duration::ZERO;
    while waited < timeout {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        waited += Duration::from_millis(2);
    }
    flag.load(Ordering::SeqCst)
}

/// S6: 일시정지 동안 전송량이 멈추고, 재개 후 동일하게 완성된다
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_freezes_progress_then_resumes() {
    const CHUNK: u32 = 65_536;
    let source = patterned(1024 * CHUNK as usize);

    let src_dir = unique_dir("src");
    tokio::fs::create_dir_all(&src_dir).await.unwrap();
    let src_path = src_dir.join("p.bin");
    tokio::fs::write(&src_path, &source).await.unwrap();

    let out_dir = unique_dir("out");
    let recv_engine = Engine::new(test_config("receiver", CHUNK, 4)).unwrap();
    let recv_done = Arc::new(AtomicBool::new(false));
    {
        let recv_done = recv_done.clone();
        recv_engine
            .start_receiving(
                Some(out_dir.clone()),
                Arc::new(|_: &IncomingTransfer| true),
                None,
                Some(Arc::new(move |result: &Result<TransferStats>| {
                    assert!(result.is_ok(), "수신 실패: {result:?}");
                    recv_done.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    let send_engine = Engine::new(test_config("sender", CHUNK, 4)).unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", recv_engine.control_port())
        .parse()
        .unwrap();

    let started = Arc::new(AtomicBool::new(false));
    let handle = {
        let started = started.clone();
        send_engine
            .send_files_to(
                target,
                vec![src_path],
                Some(Arc::new(move |_: &TransferStats| {
                    started.store(true, Ordering::SeqCst);
                })),
                None,
            )
            .unwrap()
    };

    // 첫 청크가 나간 직후 일시정지
    assert!(wait_for_fast(&started, Duration::from_secs(10)).await);
    handle.pause();
    assert_eq!(handle.state(), TransferState::Paused);

    // 워커가 청크 경계에서 멈출 시간을 주고 나서 측정한다
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frozen = handle.stats().bytes_transferred;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        handle.stats().bytes_transferred,
        frozen,
        "일시정지 중에도 전송량이 증가함"
    );
    assert!(frozen < source.len() as u64, "일시정지 전에 전송이 끝나버림");

    handle.resume();
    handle.wait().await;
    assert_eq!(handle.state(), TransferState::Complete);

    assert!(wait_for(&recv_done, Duration::from_secs(5)).await);
    let received = tokio::fs::read(out_dir.join("p.bin")).await.unwrap();
    assert_eq!(received, source, "재개 후 파일이 원본과 다름");

    send_engine.shutdown().await;
    recv_engine.shutdown().await;
}

/// 취소하면 송신은 Cancelled로 끝나고 수신측 이어받기 상태가 남는다
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_preserves_resume_state() {
    const CHUNK: u32 = 65_536;
    let source = patterned(1024 * CHUNK as usize);

    let src_dir = unique_dir("src");
    tokio::fs::create_dir_all(&src_dir).await.unwrap();
    let src_path = src_dir.join("c.bin");
    tokio::fs::write(&src_path, &source).await.unwrap();

    let out_dir = unique_dir("out");
    let resume_dir = unique_dir("resume");
    let recv_config = Config {
        resume_dir: resume_dir.clone(),
        ..test_config("receiver", CHUNK, 2)
    };
    let recv_engine = Engine::new(recv_config).unwrap();
    recv_engine
        .start_receiving(
            Some(out_dir.clone()),
            Arc::new(|_: &IncomingTransfer| true),
            None,
            None,
        )
        .unwrap();

    let send_engine = Engine::new(test_config("sender-abc", CHUNK, 2)).unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", recv_engine.control_port())
        .parse()
        .unwrap();

    let started = Arc::new(AtomicBool::new(false));
    let handle = {
        let started = started.clone();
        send_engine
            .send_files_to(
                target,
                vec![src_path],
                Some(Arc::new(move |_: &TransferStats| {
                    started.store(true, Ordering::SeqCst);
                })),
                None,
            )
            .unwrap()
    };

    assert!(wait_for_fast(&started, Duration::from_secs(10)).await);
    handle.cancel();
    handle.wait().await;
    assert_eq!(handle.state(), TransferState::Cancelled);

    // 수신측 세션이 정리될 시간을 준다
    tokio::time::sleep(Duration::from_millis(500)).await;

    // 일부 청크가 내구적으로 남았고 상태 파일이 이를 기록한다
    let store = ResumeStore::new(resume_dir).unwrap();
    let saved = store
        .load("c.bin", "sender-abc")
        .expect("취소 후 이어받기 상태가 없음");
    assert!(!saved.received_chunks.is_empty());
    assert!((saved.received_chunks.len() as u32) < saved.total_chunks);
    assert_eq!(saved.file_size, source.len() as u64);

    send_engine.shutdown().await;
    recv_engine.shutdown().await;
}
