//! # Teleport
//!
//! LAN 피어 투 피어 파일 전송 엔진
//!
//! ## 핵심 구성
//! - **디스커버리**: UDP 브로드캐스트 자기 광고 + TTL 만료 장치 레지스트리
//! - **컨트롤 채널**: 길이 프리픽스 JSON 프레임 기반 세션 상태 머신
//! - **병렬 전송**: N개 TCP 데이터 스트림에 청크 단위 분산, 순서 무관 기록
//! - **이어받기**: 수신 청크 비트맵을 디스크에 보존, 중단 지점부터 재개
//! - **파일명 살균**: 수신 파일명에서 경로 탈출과 예약어를 차단
//!
//! 송신과 수신은 대칭이다. 각 인스턴스는 [`Engine`] 하나로
//! 탐색, 송신, 수신을 모두 수행한다.

pub mod chunk;
pub mod config;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod message;
pub mod net;
pub mod receiver;
pub mod resume;
pub mod sanitize;
pub mod sender;
pub mod stats;
pub mod transfer;

pub use chunk::{ChunkHeader, ChunkTracker};
pub use config::Config;
pub use device::{Capabilities, Device, DeviceRegistry, OsType};
pub use discovery::Discovery;
pub use engine::{Engine, IncomingTransfer, TransferHandle, TransferState};
pub use error::{Error, Result};
pub use message::ControlMessage;
pub use resume::{ResumeState, ResumeStore};
pub use stats::TransferStats;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u32 = 1;

/// 디스커버리 UDP 포트
pub const DISCOVERY_PORT: u16 = 45454;

/// 컨트롤 TCP 포트 범위 시작 (0 설정 시 이 범위에서 자동 선택)
pub const CONTROL_PORT_MIN: u16 = 45455;

/// 컨트롤 TCP 포트 범위 끝 (포함)
pub const CONTROL_PORT_MAX: u16 = 45555;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: u32 = 2 * 1024 * 1024;

/// 기본 병렬 데이터 스트림 수
pub const DEFAULT_PARALLEL_STREAMS: usize = 4;

/// 기본 브로드캐스트 주기 (밀리초)
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 1000;

/// 기본 장치 TTL (밀리초)
pub const DEFAULT_DEVICE_TTL_MS: u64 = 5000;

/// 디스커버리 패킷 최대 크기 (바이트)
pub const MAX_DISCOVERY_PACKET: usize = 1024;

/// 컨트롤 프레임 페이로드 최대 크기 (바이트)
pub const MAX_CONTROL_FRAME: u32 = 1024 * 1024;

/// FILE_LIST 당 최대 파일 수
pub const MAX_FILES_PER_TRANSFER: usize = 10_000;

/// 전송 한 건의 최대 총 크기 (100 GiB)
pub const MAX_TOTAL_SIZE: u64 = 100 * 1024 * 1024 * 1024;

/// 이어받기 파일 매직 넘버 ("TPLR")
pub const RESUME_MAGIC: u32 = 0x5450_4C52;

/// 이어받기 파일 포맷 버전
pub const RESUME_VERSION: u32 = 1;
