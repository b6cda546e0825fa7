//! 장치 모델과 레지스트리
//!
//! 네트워크에서 관찰된 피어의 신원. 레지스트리는 삽입 순서를
//! 보존해서 CLI의 인덱스 지정("장치 #3")을 지원한다.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use parking_lot::Mutex;

use crate::net;

/// 운영체제 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    Windows,
    MacOs,
    Linux,
    Android,
    Ios,
    Unknown,
}

impl OsType {
    /// 와이어 문자열 표현
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Windows => "Windows",
            OsType::MacOs => "macOS",
            OsType::Linux => "Linux",
            OsType::Android => "Android",
            OsType::Ios => "iOS",
            OsType::Unknown => "Unknown",
        }
    }

    /// 와이어 문자열에서 복원 (모르는 값은 Unknown)
    pub fn parse(s: &str) -> Self {
        match s {
            "Windows" => OsType::Windows,
            "macOS" => OsType::MacOs,
            "Linux" => OsType::Linux,
            "Android" => OsType::Android,
            "iOS" => OsType::Ios,
            _ => OsType::Unknown,
        }
    }

    /// 이 프로세스가 돌고 있는 운영체제
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            OsType::Windows
        } else if cfg!(target_os = "macos") {
            OsType::MacOs
        } else if cfg!(target_os = "linux") {
            OsType::Linux
        } else if cfg!(target_os = "android") {
            OsType::Android
        } else if cfg!(target_os = "ios") {
            OsType::Ios
        } else {
            OsType::Unknown
        }
    }
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 장치 능력 비트셋
///
/// parallel과 resume만 실제 구현이고 compress/encrypt는 예약 광고다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const PARALLEL: u32 = 1 << 0;
    pub const RESUME: u32 = 1 << 1;
    pub const COMPRESS: u32 = 1 << 2;
    pub const ENCRYPT: u32 = 1 << 3;

    pub const fn none() -> Self {
        Capabilities(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Capabilities(bits)
    }

    /// 이 구현이 광고하는 기본 능력
    pub const fn default_set() -> Self {
        Capabilities(Self::PARALLEL | Self::RESUME)
    }

    pub fn contains(&self, cap: u32) -> bool {
        self.0 & cap != 0
    }

    pub fn insert(&mut self, cap: u32) {
        self.0 |= cap;
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// 디스커버리 패킷의 caps 배열로
    pub fn to_strings(&self) -> Vec<String> {
        let mut caps = Vec::new();
        if self.contains(Self::PARALLEL) {
            caps.push("parallel".to_string());
        }
        if self.contains(Self::RESUME) {
            caps.push("resume".to_string());
        }
        if self.contains(Self::COMPRESS) {
            caps.push("compress".to_string());
        }
        if self.contains(Self::ENCRYPT) {
            caps.push("encrypt".to_string());
        }
        caps
    }

    /// caps 배열에서 복원 (모르는 문자열은 무시)
    pub fn from_strings<S: AsRef<str>>(caps: &[S]) -> Self {
        let mut result = Capabilities::none();
        for cap in caps {
            match cap.as_ref() {
                "parallel" => result.insert(Self::PARALLEL),
                "resume" => result.insert(Self::RESUME),
                "compress" => result.insert(Self::COMPRESS),
                "encrypt" => result.insert(Self::ENCRYPT),
                _ => {}
            }
        }
        result
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::default_set()
    }
}

/// 네트워크에서 관찰된 피어
#[derive(Debug, Clone)]
pub struct Device {
    /// 프로세스 수명 동안 고정되는 UUID v4 (36자)
    pub id: String,

    /// 표시용 장치 이름 (64바이트 이하)
    pub name: String,

    /// 운영체제
    pub os: OsType,

    /// 컨트롤 리스너 IPv4 주소
    pub ip: Ipv4Addr,

    /// 컨트롤 리스너 TCP 포트
    pub port: u16,

    /// 장치 능력
    pub capabilities: Capabilities,

    /// 마지막 광고 수신 시각 (epoch 밀리초)
    pub last_seen_ms: u64,
}

impl Device {
    /// 컨트롤 채널 소켓 주소
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// TTL 초과 여부
    pub fn is_expired(&self, ttl_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) > ttl_ms
    }
}

struct RegistryInner {
    devices: HashMap<String, Device>,
    order: Vec<String>,
}

/// TTL 만료 장치 레지스트리
///
/// `id → Device` 매핑에 삽입 순서 벡터를 더한 구조.
/// 만료 루프가 1초마다 [`DeviceRegistry::remove_expired`]를 호출한다.
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
    ttl_ms: u64,
}

impl DeviceRegistry {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                devices: HashMap::new(),
                order: Vec::new(),
            }),
            ttl_ms,
        }
    }

    /// 장치 삽입 또는 갱신. 새 id였으면 true.
    pub fn upsert(&self, device: Device) -> bool {
        let mut inner = self.inner.lock();

        let is_new = !inner.devices.contains_key(&device.id);
        if is_new {
            inner.order.push(device.id.clone());
            tracing::debug!("새 장치 발견: {} ({})", device.name, device.id);
        }
        inner.devices.insert(device.id.clone(), device);

        is_new
    }

    /// TTL을 넘긴 장치를 제거하고 그 id 목록을 돌려준다
    pub fn remove_expired(&self) -> Vec<String> {
        let now = net::now_ms();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .devices
            .values()
            .filter(|d| d.is_expired(self.ttl_ms, now))
            .map(|d| d.id.clone())
            .collect();

        if !expired.is_empty() {
            for id in &expired {
                if let Some(device) = inner.devices.remove(id) {
                    tracing::debug!("장치 만료: {} ({})", device.name, id);
                }
            }
            let devices = std::mem::take(&mut inner.devices);
            inner.order.retain(|id| devices.contains_key(id));
            inner.devices = devices;
        }

        expired
    }

    /// id로 조회
    pub fn get(&self, id: &str) -> Option<Device> {
        self.inner.lock().devices.get(id).cloned()
    }

    /// 삽입 순서 인덱스로 조회
    pub fn get_by_index(&self, index: usize) -> Option<Device> {
        let inner = self.inner.lock();
        let id = inner.order.get(index)?;
        inner.devices.get(id).cloned()
    }

    /// 주소로 조회 (이어받기 송신자 식별용)
    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Device> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.devices.get(id))
            .find(|d| d.ip == ip)
            .cloned()
    }

    /// 삽입 순서 스냅샷
    pub fn all(&self) -> Vec<Device> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.devices.get(id).cloned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().devices.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().devices.contains_key(id)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.devices.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device(id: &str, name: &str) -> Device {
        Device {
            id: id.to_string(),
            name: name.to_string(),
            os: OsType::Linux,
            ip: Ipv4Addr::new(192, 168, 0, 10),
            port: 45455,
            capabilities: Capabilities::default_set(),
            last_seen_ms: net::now_ms(),
        }
    }

    #[test]
    fn test_upsert_new_and_refresh() {
        let registry = DeviceRegistry::new(5000);

        assert!(registry.upsert(test_device("aaaaaaaa-1111", "one")));
        assert!(!registry.upsert(test_device("aaaaaaaa-1111", "one")));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let registry = DeviceRegistry::new(5000);
        registry.upsert(test_device("aaaaaaaa-1111", "one"));
        registry.upsert(test_device("bbbbbbbb-2222", "two"));
        registry.upsert(test_device("cccccccc-3333", "three"));

        // 갱신해도 순서는 유지된다
        registry.upsert(test_device("aaaaaaaa-1111", "one"));

        let all = registry.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].name, "one");
        assert_eq!(all[1].name, "two");
        assert_eq!(all[2].name, "three");
        assert_eq!(registry.get_by_index(1).unwrap().name, "two");
        assert!(registry.get_by_index(3).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let registry = DeviceRegistry::new(100);
        registry.upsert(test_device("aaaaaaaa-1111", "one"));

        std::thread::sleep(std::time::Duration::from_millis(200));

        let expired = registry.remove_expired();
        assert_eq!(expired, vec!["aaaaaaaa-1111".to_string()]);
        assert!(!registry.contains("aaaaaaaa-1111"));
        assert_eq!(registry.count(), 0);
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_fresh_device_survives_expiry() {
        let registry = DeviceRegistry::new(60_000);
        registry.upsert(test_device("aaaaaaaa-1111", "one"));

        assert!(registry.remove_expired().is_empty());
        assert!(registry.contains("aaaaaaaa-1111"));
    }

    #[test]
    fn test_capabilities_roundtrip() {
        let caps = Capabilities::default_set();
        let strings = caps.to_strings();
        assert_eq!(strings, vec!["parallel", "resume"]);
        assert_eq!(Capabilities::from_strings(&strings), caps);

        let unknown = ["parallel", "quantum"];
        let parsed = Capabilities::from_strings(&unknown);
        assert!(parsed.contains(Capabilities::PARALLEL));
        assert!(!parsed.contains(Capabilities::RESUME));
    }

    #[test]
    fn test_os_type_strings() {
        assert_eq!(OsType::parse("Linux"), OsType::Linux);
        assert_eq!(OsType::parse("macOS"), OsType::MacOs);
        assert_eq!(OsType::parse("BeOS"), OsType::Unknown);
        assert_eq!(OsType::Ios.as_str(), "iOS");
    }
}
