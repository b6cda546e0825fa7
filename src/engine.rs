//! 엔진 퍼사드
//!
//! CLI와 데스크톱, 모바일 브리지가 소비하는 단일 진입점.
//! 콜백은 내부 워커 태스크에서 호출되므로 프런트엔드는 자신의
//! UI 스레드로 마샬링해야 한다.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::device::{Capabilities, Device, DeviceRegistry, OsType};
use crate::discovery::{Discovery, OnDeviceFound, OnDeviceLost};
use crate::receiver::Receiver;
use crate::sanitize::sanitize_device_name;
use crate::sender::SenderSession;
use crate::stats::TransferStats;
use crate::transfer::TransferControl;
use crate::{net, Error, Result};

pub use crate::receiver::{IncomingTransfer, OnIncoming};
pub use crate::transfer::{OnComplete, OnProgress, TransferState};

/// 엔진 종료 시 세션 정리를 기다리는 한도 (5초, 100ms 폴링)
const SHUTDOWN_WAIT_MS: u64 = 5_000;

/// 송신 전송 핸들
///
/// 일시정지/재개/취소는 여기서 건다. 복제해도 같은 전송을 가리킨다.
#[derive(Clone)]
pub struct TransferHandle {
    control: Arc<TransferControl>,
    state: Arc<Mutex<TransferState>>,
    stats: Arc<Mutex<TransferStats>>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl TransferHandle {
    pub fn pause(&self) {
        self.control.pause();
        let mut state = self.state.lock();
        if *state == TransferState::Transferring {
            *state = TransferState::Paused;
        }
    }

    pub fn resume(&self) {
        self.control.resume();
        let mut state = self.state.lock();
        if *state == TransferState::Paused {
            *state = TransferState::Transferring;
        }
    }

    /// 취소. 멱등이며 이미 기록된 청크와 이어받기 상태는 보존된다.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.lock().clone()
    }

    /// 세션 태스크 종료까지 대기 (완료 콜백까지 끝난 뒤 돌아온다)
    pub async fn wait(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Teleport 엔진
///
/// 생성 시 컨트롤 포트를 바인드하고 레지스트리를 초기화한다.
/// 탐색, 송신, 수신은 모두 이 값 하나에서 출발한다.
pub struct Engine {
    config: Config,
    self_device: Arc<Mutex<Device>>,
    registry: Arc<DeviceRegistry>,
    discovery: Discovery,
    control_listener: Arc<TcpListener>,
    control_port: u16,
    receiver: Mutex<Option<Arc<Receiver>>>,
    sends: Mutex<Vec<TransferHandle>>,
}

impl Engine {
    /// 엔진 생성: 설정 검증, 컨트롤 포트 바인드, 자기 장치 구성
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let (listener, control_port) = net::bind_control_listener(config.control_port)?;

        let self_device = Arc::new(Mutex::new(Device {
            id: Uuid::new_v4().to_string(),
            name: sanitize_device_name(&config.device_name),
            os: OsType::current(),
            ip: net::primary_local_ip(),
            port: control_port,
            capabilities: Capabilities::default_set(),
            last_seen_ms: net::now_ms(),
        }));

        let registry = Arc::new(DeviceRegistry::new(config.device_ttl_ms));
        let discovery = Discovery::new(
            self_device.clone(),
            registry.clone(),
            config.discovery_interval_ms,
        );

        info!(
            "Engine ready: {} on port {control_port}",
            self_device.lock().name
        );

        Ok(Self {
            config,
            self_device,
            registry,
            discovery,
            control_listener: Arc::new(listener),
            control_port,
            receiver: Mutex::new(None),
            sends: Mutex::new(Vec::new()),
        })
    }

    /// 이 프로세스의 장치 id (UUID v4)
    pub fn device_id(&self) -> String {
        self.self_device.lock().id.clone()
    }

    /// 바인드된 컨트롤 포트
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// 기본 로컬 IP (192.168.* > 10.* > 172.16~31.* 선호)
    pub fn local_ip(&self) -> Ipv4Addr {
        self.self_device.lock().ip
    }

    /// 탐색 시작
    pub fn start_discovery(
        &self,
        on_found: OnDeviceFound,
        on_lost: Option<OnDeviceLost>,
    ) -> Result<()> {
        self.discovery.start(on_found, on_lost)
    }

    /// 탐색 정지 (멱등)
    pub async fn stop_discovery(&self) -> Result<()> {
        self.discovery.stop().await;
        Ok(())
    }

    /// 주기와 무관하게 즉시 한 번 광고
    pub async fn broadcast_now(&self) -> Result<()> {
        self.discovery.broadcast_now().await
    }

    /// 레지스트리 스냅샷 (삽입 순서)
    pub fn devices(&self) -> Vec<Device> {
        self.registry.all()
    }

    /// 삽입 순서 인덱스로 장치 조회
    pub fn device_at(&self, index: usize) -> Result<Device> {
        self.registry
            .get_by_index(index)
            .ok_or_else(|| Error::DeviceNotFound(format!("index {index}")))
    }

    /// 발견된 장치로 파일 송신
    pub fn send_files(
        &self,
        target: &Device,
        paths: Vec<PathBuf>,
        on_progress: Option<OnProgress>,
        on_complete: Option<OnComplete>,
    ) -> Result<TransferHandle> {
        self.send_files_to(target.addr(), paths, on_progress, on_complete)
    }

    /// 주소를 직접 지정해 파일 송신
    pub fn send_files_to(
        &self,
        target: SocketAddr,
        paths: Vec<PathBuf>,
        on_progress: Option<OnProgress>,
        on_complete: Option<OnComplete>,
    ) -> Result<TransferHandle> {
        if paths.is_empty() {
            return Err(Error::InvalidArgument("보낼 파일이 없음".into()));
        }

        let session = SenderSession::new(self.config.clone());
        let control = session.control();
        let state = session.state_handle();
        let stats = session.stats_handle();

        let task = tokio::spawn(async move {
            let result = session.run(target, paths, on_progress).await;
            if let Err(e) = &result {
                debug!("송신 세션 종료: {e}");
            }
            if let Some(on_complete) = on_complete {
                on_complete(&result);
            }
        });

        let handle = TransferHandle {
            control,
            state,
            stats,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        };
        self.sends.lock().push(handle.clone());
        Ok(handle)
    }

    /// 수신 시작: 컨트롤 서버 수락 루프를 연다
    pub fn start_receiving(
        &self,
        output_dir: Option<PathBuf>,
        on_incoming: OnIncoming,
        on_progress: Option<OnProgress>,
        on_complete: Option<OnComplete>,
    ) -> Result<()> {
        let mut slot = self.receiver.lock();
        if slot.as_ref().is_some_and(|r| r.is_running()) {
            return Err(Error::AlreadyRunning);
        }

        let receiver = Arc::new(Receiver::new(
            self.config.clone(),
            self.registry.clone(),
            self.control_listener.clone(),
            output_dir.unwrap_or_else(|| self.config.download_dir.clone()),
            on_incoming,
            on_progress,
            on_complete,
        )?);
        receiver.start()?;

        *slot = Some(receiver);
        Ok(())
    }

    /// 수신 정지 (멱등). 진행 중 세션은 끝까지 달리게 둔다.
    pub async fn stop_receiving(&self) -> Result<()> {
        let receiver = self.receiver.lock().clone();
        if let Some(receiver) = receiver {
            receiver.stop().await;
        }
        Ok(())
    }

    /// 질서 있는 종료
    ///
    /// 진행 중 전송에 취소를 걸고 최대 5초(100ms 폴링) 동안
    /// Transferring/Paused를 벗어나기를 기다린 뒤, 수신과 탐색을
    /// 차례로 정지한다. 반환 후에는 어떤 콜백도 불리지 않는다.
    pub async fn shutdown(&self) {
        // 취소 신호
        let sends: Vec<TransferHandle> = self.sends.lock().clone();
        for handle in &sends {
            if !handle.state().is_terminal() {
                handle.cancel();
            }
        }
        let receiver = self.receiver.lock().clone();
        if let Some(receiver) = &receiver {
            receiver.cancel_active();
        }

        // 정리 대기
        let mut waited = 0;
        while waited < SHUTDOWN_WAIT_MS {
            let sending = sends.iter().any(|h| {
                matches!(
                    h.state(),
                    TransferState::Transferring | TransferState::Paused
                )
            });
            let receiving = receiver
                .as_ref()
                .is_some_and(|r| r.has_active_transfer());
            if !sending && !receiving {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += 100;
        }

        // 송신 태스크 조인 (완료 콜백까지 소진)
        for handle in &sends {
            handle.wait().await;
        }
        self.sends.lock().clear();

        // 수신과 탐색 정지
        if let Some(receiver) = receiver {
            receiver.stop().await;
        }
        self.discovery.stop().await;

        info!("Engine shut down");
    }
}
