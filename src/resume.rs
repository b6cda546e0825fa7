//! 이어받기 상태 저장소
//!
//! 부분 수신 파일마다 작은 바이너리 파일 하나를 남긴다.
//! 파일명은 `crc32(file_name + sender_id)`의 16진수, 확장자 `.resume`.
//!
//! 포맷: 매직 "TPLR"(4) + 버전(4) + 본문. 정수는 빅엔디안,
//! 문자열은 u32 길이 프리픽스. 매직이나 버전이 다르면 없는 것으로 친다.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{net, Error, Result, RESUME_MAGIC, RESUME_VERSION};

/// 이어받기 상태 보관 기한 기본값 (24시간)
pub const DEFAULT_MAX_AGE_SECS: u64 = 86_400;

/// 부분 수신 파일의 보존 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    /// 송신측이 알린 원래 파일명 (디스크 경로가 아님)
    pub file_name: String,
    pub file_size: u64,
    pub file_id: u32,
    pub chunk_size: u32,
    pub total_chunks: u32,
    /// 내구적으로 기록 완료된 청크 id
    pub received_chunks: Vec<u32>,
    pub sender_id: String,
    pub session_token: String,
    /// 마지막 저장 시각 (epoch 초)
    pub timestamp: u64,
}

impl ResumeState {
    pub fn is_valid(&self) -> bool {
        self.file_size > 0 && self.total_chunks > 0 && !self.file_name.is_empty()
    }

    /// 수신 진행률 (0.0 ~ 1.0)
    pub fn progress(&self) -> f32 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.received_chunks.len() as f32 / self.total_chunks as f32
    }

    /// 바이너리 직렬화
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(64 + self.received_chunks.len() * 4);

        write_u32(&mut data, RESUME_MAGIC);
        write_u32(&mut data, RESUME_VERSION);

        write_str(&mut data, &self.file_name);
        write_u64(&mut data, self.file_size);
        write_u32(&mut data, self.file_id);
        write_u32(&mut data, self.chunk_size);
        write_u32(&mut data, self.total_chunks);
        write_u32(&mut data, self.received_chunks.len() as u32);
        for &chunk in &self.received_chunks {
            write_u32(&mut data, chunk);
        }
        write_str(&mut data, &self.sender_id);
        write_str(&mut data, &self.session_token);
        write_u64(&mut data, self.timestamp);

        data
    }

    /// 바이너리 역직렬화. 매직/버전 불일치나 잘림은 None.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut reader = Reader { data, pos: 0 };

        if reader.read_u32()? != RESUME_MAGIC {
            return None;
        }
        if reader.read_u32()? != RESUME_VERSION {
            return None;
        }

        let file_name = reader.read_str()?;
        let file_size = reader.read_u64()?;
        let file_id = reader.read_u32()?;
        let chunk_size = reader.read_u32()?;
        let total_chunks = reader.read_u32()?;

        let chunk_count = reader.read_u32()?;
        // 청크 수가 본문 길이보다 클 수 없다
        if chunk_count as usize > data.len() / 4 {
            return None;
        }
        let mut received_chunks = Vec::with_capacity(chunk_count as usize);
        for _ in 0..chunk_count {
            received_chunks.push(reader.read_u32()?);
        }

        let sender_id = reader.read_str()?;
        let session_token = reader.read_str()?;
        let timestamp = reader.read_u64()?;

        Some(Self {
            file_name,
            file_size,
            file_id,
            chunk_size,
            total_chunks,
            received_chunks,
            sender_id,
            session_token,
            timestamp,
        })
    }
}

fn write_u32(data: &mut Vec<u8>, v: u32) {
    data.extend_from_slice(&v.to_be_bytes());
}

fn write_u64(data: &mut Vec<u8>, v: u64) {
    data.extend_from_slice(&v.to_be_bytes());
}

fn write_str(data: &mut Vec<u8>, s: &str) {
    write_u32(data, s.len() as u32);
    data.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Option<u64> {
        let bytes = self.data.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_str(&mut self) -> Option<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

/// 이어받기 상태 저장소
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    /// 저장 디렉터리를 만들며 연다
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::FileOpen(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// (파일명, 송신자) 쌍의 저장 경로
    fn state_path(&self, file_name: &str, sender_id: &str) -> PathBuf {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(file_name.as_bytes());
        hasher.update(sender_id.as_bytes());
        self.dir.join(format!("{:08x}.resume", hasher.finalize()))
    }

    /// 상태 저장 (타임스탬프는 현재 시각으로 갱신)
    pub fn save(&self, state: &ResumeState) -> Result<()> {
        let mut stamped = state.clone();
        stamped.timestamp = net::now_secs();

        let path = self.state_path(&state.file_name, &state.sender_id);
        fs::write(&path, stamped.encode())
            .map_err(|e| Error::FileWrite(format!("{}: {e}", path.display())))?;

        debug!(
            "이어받기 상태 저장: {} ({}/{} 청크)",
            state.file_name,
            state.received_chunks.len(),
            state.total_chunks
        );
        Ok(())
    }

    /// 상태 로드. 없거나 손상이면 None.
    pub fn load(&self, file_name: &str, sender_id: &str) -> Option<ResumeState> {
        let path = self.state_path(file_name, sender_id);
        let data = fs::read(&path).ok()?;

        let state = ResumeState::decode(&data)?;
        if !state.is_valid() {
            return None;
        }

        debug!(
            "이어받기 상태 로드: {} ({}/{} 청크)",
            state.file_name,
            state.received_chunks.len(),
            state.total_chunks
        );
        Some(state)
    }

    pub fn has_state(&self, file_name: &str, sender_id: &str) -> bool {
        self.state_path(file_name, sender_id).exists()
    }

    /// 전송 성공 후 상태 제거
    pub fn clear(&self, file_name: &str, sender_id: &str) {
        let path = self.state_path(file_name, sender_id);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("이어받기 상태 삭제 실패: {e}");
            }
        }
    }

    /// 기한을 넘긴 상태 일괄 제거. 제거한 개수를 돌려준다.
    pub fn cleanup(&self, max_age_seconds: u64) -> usize {
        let now = net::now_secs();
        let mut removed = 0;

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("이어받기 디렉터리 열기 실패: {e}");
                return 0;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("resume") {
                continue;
            }

            let stale = match fs::read(&path).ok().and_then(|d| ResumeState::decode(&d)) {
                Some(state) => now.saturating_sub(state.timestamp) > max_age_seconds,
                // 해석 불가능한 파일도 치운다
                None => true,
            };

            if stale && fs::remove_file(&path).is_ok() {
                debug!("오래된 이어받기 상태 제거: {}", path.display());
                removed += 1;
            }
        }

        removed
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
