//! 네트워크 유틸리티
//!
//! 로컬 IP 선택, 브로드캐스트 주소 유도, 포트 스캔, 세션 토큰 생성.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::{Error, Result, CONTROL_PORT_MAX, CONTROL_PORT_MIN};

/// 현재 벽시계 시간 (epoch 밀리초)
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 현재 벽시계 시간 (epoch 초)
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 문자열이 IPv4 점표기인지 검증
pub fn validate_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

/// 기본 로컬 IPv4 선택
///
/// 선호 순서: `192.168.*` > `10.*` > `172.16~31.*` > 첫 후보.
/// 루프백(127.*)과 링크로컬(169.254.*)은 항상 제외하고,
/// 후보가 없으면 127.0.0.1을 돌려준다.
pub fn primary_local_ip() -> Ipv4Addr {
    let candidates = probe_local_ips();

    for ip in &candidates {
        let [a, b, _, _] = ip.octets();
        if a == 192 && b == 168 {
            return *ip;
        }
    }
    for ip in &candidates {
        if ip.octets()[0] == 10 {
            return *ip;
        }
    }
    for ip in &candidates {
        let [a, b, _, _] = ip.octets();
        if a == 172 && (16..=31).contains(&b) {
            return *ip;
        }
    }

    candidates
        .into_iter()
        .next()
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// 라우팅 테이블이 선택하는 소스 주소를 후보로 수집
///
/// 대상별로 UDP connect 후 local_addr를 읽는다. 패킷은 나가지 않는다.
fn probe_local_ips() -> Vec<Ipv4Addr> {
    const PROBE_TARGETS: [&str; 4] = [
        "192.168.255.255:45454",
        "10.255.255.255:45454",
        "172.31.255.255:45454",
        "8.8.8.8:53",
    ];

    let mut candidates = Vec::new();

    for target in PROBE_TARGETS {
        let Ok(socket) = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
            continue;
        };
        if socket.connect(target).is_err() {
            continue;
        }
        if let Ok(SocketAddr::V4(addr)) = socket.local_addr() {
            let ip = *addr.ip();
            if !ip.is_loopback() && !ip.is_link_local() && !candidates.contains(&ip) {
                candidates.push(ip);
            }
        }
    }

    candidates
}

/// 서브넷 브로드캐스트 주소 유도 (마지막 옥텟을 255로)
pub fn broadcast_for(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// 디스커버리용 UDP 소켓 바인드 (SO_REUSEADDR + SO_BROADCAST)
pub fn bind_discovery_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::SocketCreate(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::SocketCreate(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::SocketCreate(e.to_string()))?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|e| Error::SocketBind(format!("udp {port}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::SocketCreate(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(|e| Error::SocketCreate(e.to_string()))
}

/// 컨트롤 리스너 바인드
///
/// `preferred`가 0이면 45455~45555 범위를 순서대로 스캔해
/// 첫 빈 포트를 잡는다. 실제 바인드된 포트를 함께 돌려준다.
pub fn bind_control_listener(preferred: u16) -> Result<(TcpListener, u16)> {
    if preferred != 0 {
        let listener = bind_reuse_tcp(preferred)?;
        return Ok((listener, preferred));
    }

    for port in CONTROL_PORT_MIN..=CONTROL_PORT_MAX {
        if let Ok(listener) = bind_reuse_tcp(port) {
            return Ok((listener, port));
        }
    }

    Err(Error::SocketBind(format!(
        "{CONTROL_PORT_MIN}~{CONTROL_PORT_MAX} 범위에 빈 포트 없음"
    )))
}

fn bind_reuse_tcp(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::SocketCreate(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::SocketCreate(e.to_string()))?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|e| Error::SocketBind(format!("tcp {port}: {e}")))?;
    socket
        .listen(128)
        .map_err(|e| Error::SocketBind(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::SocketCreate(e.to_string()))?;

    TcpListener::from_std(socket.into()).map_err(|e| Error::SocketCreate(e.to_string()))
}

/// 세션 토큰 생성 (32자리 16진수, 128비트)
pub fn generate_session_token() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| char::from_digit(rng.gen_range(0..16u32), 16).unwrap())
        .collect()
}

/// 토큰 형식 검증 (길이 + 16진수 문자)
pub fn validate_token_format(token: &str) -> bool {
    token.len() == 32 && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// 기본 장치 이름 (호스트명, 없으면 "teleport")
pub fn default_device_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    "teleport".to_string()
}
