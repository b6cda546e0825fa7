//! 엔진 설정

use std::path::PathBuf;

use crate::{
    net, Error, Result, CONTROL_PORT_MAX, CONTROL_PORT_MIN, DEFAULT_CHUNK_SIZE,
    DEFAULT_DEVICE_TTL_MS, DEFAULT_DISCOVERY_INTERVAL_MS, DEFAULT_PARALLEL_STREAMS,
};

/// Teleport 엔진 설정
///
/// 엔진 생성 시점에 고정되며 이후 변경되지 않는다.
#[derive(Debug, Clone)]
pub struct Config {
    /// 브로드캐스트에 실을 장치 이름
    pub device_name: String,

    /// 컨트롤 포트 (0이면 45455~45555 범위에서 자동 선택)
    pub control_port: u16,

    /// 청크 크기 (바이트)
    pub chunk_size: u32,

    /// 병렬 데이터 스트림 수
    pub parallel_streams: usize,

    /// 브로드캐스트 주기 (밀리초)
    pub discovery_interval_ms: u64,

    /// 장치 TTL (밀리초)
    pub device_ttl_ms: u64,

    /// 기본 다운로드 디렉터리
    pub download_dir: PathBuf,

    /// 이어받기 상태 디렉터리
    pub resume_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: net::default_device_name(),
            control_port: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallel_streams: DEFAULT_PARALLEL_STREAMS,
            discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
            device_ttl_ms: DEFAULT_DEVICE_TTL_MS,
            download_dir: PathBuf::from("."),
            resume_dir: PathBuf::from(".teleport-resume"),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정값 검증
    pub fn validate(&self) -> Result<()> {
        if self.device_name.is_empty() {
            return Err(Error::InvalidArgument("장치 이름이 비어 있음".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk_size는 0이 될 수 없음".into()));
        }
        if self.parallel_streams == 0 || self.parallel_streams > 32 {
            return Err(Error::InvalidArgument(format!(
                "parallel_streams 범위 초과: {}",
                self.parallel_streams
            )));
        }
        if self.control_port != 0
            && !(CONTROL_PORT_MIN..=CONTROL_PORT_MAX).contains(&self.control_port)
        {
            return Err(Error::InvalidArgument(format!(
                "컨트롤 포트 범위 초과: {}",
                self.control_port
            )));
        }
        if self.discovery_interval_ms == 0 || self.device_ttl_ms == 0 {
            return Err(Error::InvalidArgument(
                "디스커버리 주기와 TTL은 0이 될 수 없음".into(),
            ));
        }
        Ok(())
    }

    /// 파일 크기에 대한 총 청크 수 계산
    pub fn total_chunks(&self, file_size: u64) -> u32 {
        crate::chunk::chunk_count(file_size, self.chunk_size)
    }
}
