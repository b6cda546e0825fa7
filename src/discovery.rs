//! 장치 탐색
//!
//! 디스커버리 포트(45454/udp)에 묶인 두 루프와 만료 루프 하나:
//! - **브로드캐스터**: 주기마다 자기 장치를 JSON 패킷으로 서브넷에 광고
//! - **리스너**: 500ms 타임아웃으로 수신, 버전/자기 에코 필터 후 레지스트리에 반영
//! - **만료**: 1초마다 TTL 초과 장치 제거, lost 콜백 통지

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{Capabilities, Device, DeviceRegistry, OsType};
use crate::sanitize::sanitize_device_name;
use crate::{net, Error, Result, DISCOVERY_PORT, MAX_DISCOVERY_PACKET, PROTOCOL_VERSION};

/// 장치 발견 콜백
pub type OnDeviceFound = Arc<dyn Fn(Device) + Send + Sync>;

/// 장치 소실 콜백 (인자는 장치 id)
pub type OnDeviceLost = Arc<dyn Fn(String) + Send + Sync>;

/// 디스커버리 UDP 패킷
///
/// 길이 프리픽스 없는 단일 JSON, 최대 1024바이트.
#[derive(Debug, Serialize, Deserialize)]
struct AnnouncePacket {
    /// 프로토콜 버전
    v: u32,
    id: String,
    name: String,
    os: String,
    ip: String,
    port: u16,
    caps: Vec<String>,
}

impl AnnouncePacket {
    fn from_device(device: &Device) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: device.id.clone(),
            name: device.name.clone(),
            os: device.os.as_str().to_string(),
            ip: device.ip.to_string(),
            port: device.port,
            caps: device.capabilities.to_strings(),
        }
    }
}

/// 수신 패킷을 Device로 해석
///
/// 버전이 다르면 버린다(debug 로그만). 패킷의 ip가 비었거나
/// 0.0.0.0이면 실제 송신 주소를 신뢰한다.
fn parse_packet(data: &[u8], sender_ip: Ipv4Addr) -> Option<Device> {
    let packet: AnnouncePacket = match serde_json::from_slice(data) {
        Ok(p) => p,
        Err(e) => {
            debug!("디스커버리 패킷 파싱 실패: {e}");
            return None;
        }
    };

    if packet.v != PROTOCOL_VERSION {
        debug!("버전 불일치 패킷 무시: v={}", packet.v);
        return None;
    }

    let ip = match packet.ip.parse::<Ipv4Addr>() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => sender_ip,
    };

    Some(Device {
        id: packet.id,
        name: sanitize_device_name(&packet.name),
        os: OsType::parse(&packet.os),
        ip,
        port: packet.port,
        capabilities: Capabilities::from_strings(&packet.caps),
        last_seen_ms: net::now_ms(),
    })
}

/// 디스커버리 서브시스템
///
/// 상태 머신은 {Stopped, Running} 둘뿐이다. `start`는 Running에서
/// `AlreadyRunning`으로 실패하고 `stop`은 멱등이며 세 태스크를
/// 모두 조인한 뒤 돌아온다.
pub struct Discovery {
    /// 광고할 자기 장치 (컨트롤 포트는 나중에 갱신될 수 있음)
    self_device: Arc<Mutex<Device>>,
    registry: Arc<DeviceRegistry>,
    interval_ms: u64,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    broadcast_socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl Discovery {
    pub fn new(
        self_device: Arc<Mutex<Device>>,
        registry: Arc<DeviceRegistry>,
        interval_ms: u64,
    ) -> Self {
        Self {
            self_device,
            registry,
            interval_ms,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            broadcast_socket: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 탐색 시작: 브로드캐스트 + 리스너 + 만료 루프를 띄운다
    pub fn start(&self, on_found: OnDeviceFound, on_lost: Option<OnDeviceLost>) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        let listen_socket = match net::bind_discovery_socket(DISCOVERY_PORT) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        // 송신용 소켓은 따로 연다 (포트 바인드 불필요)
        let send_socket = match net::bind_discovery_socket(0) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.broadcast_socket.lock() = Some(send_socket.clone());

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_broadcaster(send_socket));
        tasks.push(self.spawn_listener(listen_socket, on_found));
        tasks.push(self.spawn_expirer(on_lost));

        info!("Discovery started on udp/{DISCOVERY_PORT}");
        Ok(())
    }

    fn spawn_broadcaster(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let running = self.running.clone();
        let self_device = self.self_device.clone();
        let interval_ms = self.interval_ms;

        tokio::spawn(async move {
            let local_ip = net::primary_local_ip();
            let target =
                SocketAddr::V4(SocketAddrV4::new(net::broadcast_for(local_ip), DISCOVERY_PORT));

            while running.load(Ordering::SeqCst) {
                let packet = {
                    let mut device = self_device.lock();
                    device.last_seen_ms = net::now_ms();
                    AnnouncePacket::from_device(&device)
                };

                match serde_json::to_vec(&packet) {
                    Ok(bytes) if bytes.len() <= MAX_DISCOVERY_PACKET => {
                        if let Err(e) = socket.send_to(&bytes, target).await {
                            warn!("브로드캐스트 실패: {e}");
                        }
                    }
                    Ok(bytes) => warn!("디스커버리 패킷 과대: {} bytes", bytes.len()),
                    Err(e) => warn!("디스커버리 패킷 직렬화 실패: {e}"),
                }

                // 100ms 단위로 쪼개 자면 한 주기 안에 정지에 반응한다
                let mut slept = 0;
                while slept < interval_ms && running.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    slept += 100;
                }
            }
        })
    }

    fn spawn_listener(&self, socket: Arc<UdpSocket>, on_found: OnDeviceFound) -> JoinHandle<()> {
        let running = self.running.clone();
        let registry = self.registry.clone();
        let self_device = self.self_device.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DISCOVERY_PACKET];

            while running.load(Ordering::SeqCst) {
                let recv =
                    tokio::time::timeout(Duration::from_millis(500), socket.recv_from(&mut buf))
                        .await;

                match recv {
                    Ok(Ok((len, src))) => {
                        let sender_ip = match src {
                            SocketAddr::V4(a) => *a.ip(),
                            SocketAddr::V6(_) => continue,
                        };
                        let Some(device) = parse_packet(&buf[..len], sender_ip) else {
                            continue;
                        };
                        // 자기 에코 필터
                        if device.id == self_device.lock().id {
                            continue;
                        }
                        if registry.upsert(device.clone()) {
                            on_found(device);
                        }
                    }
                    Ok(Err(e)) => warn!("디스커버리 수신 에러: {e}"),
                    Err(_) => {} // 타임아웃, 정지 플래그 확인 후 계속
                }
            }
        })
    }

    fn spawn_expirer(&self, on_lost: Option<OnDeviceLost>) -> JoinHandle<()> {
        let running = self.running.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let expired = registry.remove_expired();
                if let Some(on_lost) = &on_lost {
                    for id in expired {
                        on_lost(id);
                    }
                }
            }
        })
    }

    /// 즉시 한 번 광고 (주기와 무관하게)
    pub async fn broadcast_now(&self) -> Result<()> {
        let socket = self
            .broadcast_socket
            .lock()
            .clone()
            .ok_or(Error::NotRunning)?;

        let packet = {
            let mut device = self.self_device.lock();
            device.last_seen_ms = net::now_ms();
            AnnouncePacket::from_device(&device)
        };
        let bytes =
            serde_json::to_vec(&packet).map_err(|e| Error::Internal(e.to_string()))?;

        let local_ip = net::primary_local_ip();
        let target = SocketAddr::V4(SocketAddrV4::new(
            net::broadcast_for(local_ip),
            DISCOVERY_PORT,
        ));
        socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| Error::SocketSend(e.to_string()))?;
        Ok(())
    }

    /// 탐색 정지. 멱등이며 세 태스크를 조인한 뒤 돌아온다.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        *self.broadcast_socket.lock() = None;
        self.registry.clear();
        info!("Discovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        serde_json::to_vec(&AnnouncePacket {
            v: PROTOCOL_VERSION,
            id: "11111111-2222-4333-8444-555555555555".to_string(),
            name: "desk".to_string(),
            os: "Linux".to_string(),
            ip: "192.168.0.7".to_string(),
            port: 45460,
            caps: vec!["parallel".to_string(), "resume".to_string()],
        })
        .unwrap()
    }

    #[test]
    fn test_parse_valid_packet() {
        let device = parse_packet(&sample_packet(), Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert_eq!(device.name, "desk");
        assert_eq!(device.os, OsType::Linux);
        assert_eq!(device.ip, Ipv4Addr::new(192, 168, 0, 7));
        assert_eq!(device.port, 45460);
        assert!(device.capabilities.contains(Capabilities::PARALLEL));
    }

    #[test]
    fn test_parse_rejects_wrong_version() {
        let mut value: serde_json::Value = serde_json::from_slice(&sample_packet()).unwrap();
        value["v"] = serde_json::json!(99);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(parse_packet(&bytes, Ipv4Addr::new(10, 0, 0, 1)).is_none());
    }

    #[test]
    fn test_parse_falls_back_to_sender_ip() {
        let mut value: serde_json::Value = serde_json::from_slice(&sample_packet()).unwrap();
        value["ip"] = serde_json::json!("0.0.0.0");
        let bytes = serde_json::to_vec(&value).unwrap();
        let device = parse_packet(&bytes, Ipv4Addr::new(10, 0, 0, 9)).unwrap();
        assert_eq!(device.ip, Ipv4Addr::new(10, 0, 0, 9));

        value["ip"] = serde_json::json!("");
        let bytes = serde_json::to_vec(&value).unwrap();
        let device = parse_packet(&bytes, Ipv4Addr::new(10, 0, 0, 9)).unwrap();
        assert_eq!(device.ip, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_packet(b"not json", Ipv4Addr::LOCALHOST).is_none());
        assert!(parse_packet(b"{}", Ipv4Addr::LOCALHOST).is_none());
    }

    #[test]
    fn test_announce_packet_fits_limit() {
        let device = Device {
            id: "11111111-2222-4333-8444-555555555555".to_string(),
            name: "n".repeat(64),
            os: OsType::Windows,
            ip: Ipv4Addr::new(192, 168, 100, 200),
            port: 45555,
            capabilities: Capabilities::from_bits(
                Capabilities::PARALLEL
                    | Capabilities::RESUME
                    | Capabilities::COMPRESS
                    | Capabilities::ENCRYPT,
            ),
            last_seen_ms: 0,
        };
        let bytes = serde_json::to_vec(&AnnouncePacket::from_device(&device)).unwrap();
        assert!(bytes.len() <= MAX_DISCOVERY_PACKET);
    }

    #[tokio::test]
    async fn test_start_twice_fails_stop_idempotent() {
        let self_device = Arc::new(Mutex::new(Device {
            id: "11111111-2222-4333-8444-555555555555".to_string(),
            name: "me".to_string(),
            os: OsType::Linux,
            ip: Ipv4Addr::LOCALHOST,
            port: 45455,
            capabilities: Capabilities::default_set(),
            last_seen_ms: 0,
        }));
        let registry = Arc::new(DeviceRegistry::new(5000));
        let discovery = Discovery::new(self_device, registry, 1000);

        let on_found: OnDeviceFound = Arc::new(|_| {});
        discovery.start(on_found.clone(), None).unwrap();
        assert!(matches!(
            discovery.start(on_found, None),
            Err(Error::AlreadyRunning)
        ));

        discovery.stop().await;
        discovery.stop().await; // 멱등
        assert!(!discovery.is_running());
    }
}
