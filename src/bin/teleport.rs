//! Teleport CLI - LAN 파일 전송
//!
//! 사용법:
//!   teleport discover [--timeout SECS]
//!   teleport send FILES... --to (INDEX|IP) [--port P]
//!   teleport receive [--output DIR] [--auto-accept]
//!   teleport version
//!
//! 예시:
//!   # 주변 장치 5초간 탐색
//!   teleport discover
//!
//!   # 첫 번째 장치로 전송
//!   teleport send big.iso --to 0
//!
//!   # IP 직접 지정
//!   teleport send a.bin b.bin --to 192.168.0.7 --port 45455
//!
//!   # 자동 수락 수신
//!   teleport receive --output ./downloads --auto-accept

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use teleport::engine::{Engine, IncomingTransfer};
use teleport::stats::format_bytes;
use teleport::{Config, Device, Error, Result, CONTROL_PORT_MIN, PROTOCOL_VERSION};

enum Command {
    Discover {
        timeout_secs: u64,
    },
    Send {
        files: Vec<PathBuf>,
        to: String,
        port: u16,
    },
    Receive {
        output: Option<PathBuf>,
        auto_accept: bool,
    },
    Version,
    Help,
}

fn print_help() {
    println!(
        r#"Teleport - LAN 파일 전송

사용법:
  teleport discover [--timeout SECS]       주변 장치 탐색
  teleport send FILES... --to (INDEX|IP)   파일 전송
                [--port P]
  teleport receive [--output DIR]          수신 대기
                   [--auto-accept]
  teleport version                         버전 출력

옵션:
  --timeout SECS    탐색 시간 (기본: 5초)
  --to INDEX|IP     대상: discover 인덱스 또는 IPv4 주소
  --port P          IP 지정 시 컨트롤 포트 (기본: {CONTROL_PORT_MIN})
  --output DIR      저장 디렉터리 (기본: 현재 디렉터리)
  --auto-accept     수신 문의를 자동 수락
  -h, --help        이 도움말

종료 코드: 성공 0, 실패 1
"#
    );
}

fn parse_args(args: &[String]) -> std::result::Result<Command, String> {
    let Some(command) = args.first() else {
        return Ok(Command::Help);
    };

    match command.as_str() {
        "discover" => {
            let mut timeout_secs = 5;
            let mut i = 1;
            while i < args.len() {
                match args[i].as_str() {
                    "--timeout" => {
                        i += 1;
                        timeout_secs = args
                            .get(i)
                            .and_then(|v| v.parse().ok())
                            .ok_or("--timeout 값이 필요함")?;
                    }
                    other => return Err(format!("알 수 없는 옵션: {other}")),
                }
                i += 1;
            }
            Ok(Command::Discover { timeout_secs })
        }
        "send" => {
            let mut files = Vec::new();
            let mut to = None;
            let mut port = CONTROL_PORT_MIN;
            let mut i = 1;
            while i < args.len() {
                match args[i].as_str() {
                    "--to" => {
                        i += 1;
                        to = Some(args.get(i).ok_or("--to 값이 필요함")?.clone());
                    }
                    "--port" => {
                        i += 1;
                        port = args
                            .get(i)
                            .and_then(|v| v.parse().ok())
                            .ok_or("--port 값이 필요함")?;
                    }
                    other if other.starts_with("--") => {
                        return Err(format!("알 수 없는 옵션: {other}"))
                    }
                    file => files.push(PathBuf::from(file)),
                }
                i += 1;
            }
            let to = to.ok_or("--to가 필요함")?;
            if files.is_empty() {
                return Err("보낼 파일이 없음".into());
            }
            Ok(Command::Send { files, to, port })
        }
        "receive" => {
            let mut output = None;
            let mut auto_accept = false;
            let mut i = 1;
            while i < args.len() {
                match args[i].as_str() {
                    "--output" => {
                        i += 1;
                        output = Some(PathBuf::from(args.get(i).ok_or("--output 값이 필요함")?));
                    }
                    "--auto-accept" => auto_accept = true,
                    other => return Err(format!("알 수 없는 옵션: {other}")),
                }
                i += 1;
            }
            Ok(Command::Receive {
                output,
                auto_accept,
            })
        }
        "version" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("알 수 없는 명령: {other}")),
    }
}

fn print_device_row(index: usize, device: &Device) {
    println!(
        "  [{index}] {} ({}) {}:{}",
        device.name, device.os, device.ip, device.port
    );
}

async fn run_discover(timeout_secs: u64) -> Result<()> {
    let engine = Engine::new(Config::default())?;

    println!("탐색 중... ({timeout_secs}초)");
    engine.start_discovery(
        Arc::new(|device: Device| {
            println!("  + {} ({}) {}:{}", device.name, device.os, device.ip, device.port);
        }),
        Some(Arc::new(|id: String| {
            println!("  - 장치 사라짐: {id}");
        })),
    )?;

    tokio::time::sleep(Duration::from_secs(timeout_secs)).await;

    let devices = engine.devices();
    println!();
    if devices.is_empty() {
        println!("발견된 장치 없음");
    } else {
        println!("발견된 장치 {}개:", devices.len());
        for (index, device) in devices.iter().enumerate() {
            print_device_row(index, device);
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn resolve_target(engine: &Engine, to: &str, port: u16) -> Result<SocketAddr> {
    // 숫자면 discover 인덱스, 아니면 IPv4 주소
    if let Ok(index) = to.parse::<usize>() {
        println!("장치 목록 갱신 중...");
        engine.start_discovery(Arc::new(|_: Device| {}), None)?;
        tokio::time::sleep(Duration::from_secs(3)).await;
        engine.stop_discovery().await?;

        let device = engine.device_at(index)?;
        println!("대상: {} ({}:{})", device.name, device.ip, device.port);
        return Ok(device.addr());
    }

    let ip: IpAddr = to
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("잘못된 대상: {to}")))?;
    Ok(SocketAddr::new(ip, port))
}

async fn run_send(files: Vec<PathBuf>, to: String, port: u16) -> Result<()> {
    let engine = Engine::new(Config::default())?;
    let target = resolve_target(&engine, &to, port).await?;

    let handle = engine.send_files_to(
        target,
        files,
        Some(Arc::new(|stats: &teleport::TransferStats| {
            // 같은 줄을 덮어쓰며 진행률 표시
            print!(
                "\r{:>5.1}% {} / {} ({}/s)   ",
                stats.progress_ratio() * 100.0,
                format_bytes(stats.bytes_transferred),
                format_bytes(stats.bytes_total),
                format_bytes(stats.speed_bps as u64),
            );
            use std::io::Write;
            let _ = std::io::stdout().flush();
        })),
        None,
    )?;

    handle.wait().await;
    println!();

    match handle.state() {
        teleport::TransferState::Complete => {
            let stats = handle.stats();
            println!(
                "전송 완료: 파일 {}개, {}",
                stats.files_completed,
                format_bytes(stats.bytes_transferred)
            );
            engine.shutdown().await;
            Ok(())
        }
        state => {
            engine.shutdown().await;
            Err(Error::TransferFailed(format!("종료 상태: {state:?}")))
        }
    }
}

async fn run_receive(output: Option<PathBuf>, auto_accept: bool) -> Result<()> {
    let engine = Engine::new(Config::default())?;

    engine.start_receiving(
        output,
        Arc::new(move |incoming: &IncomingTransfer| {
            println!(
                "수신 문의: {} ({})가 파일 {}개 ({}) 전송 요청",
                incoming.sender_name,
                incoming.sender_ip,
                incoming.files.len(),
                format_bytes(incoming.total_size),
            );
            for file in &incoming.files {
                println!("    {} ({})", file.name, format_bytes(file.size));
            }

            if auto_accept {
                println!("자동 수락");
                return true;
            }

            // 워커 스레드에서 불리므로 동기 stdin을 읽어도 된다
            print!("수락? [y/N] ");
            use std::io::Write;
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            matches!(line.trim(), "y" | "Y" | "yes")
        }),
        Some(Arc::new(|stats: &teleport::TransferStats| {
            print!(
                "\r{:>5.1}% {} / {}   ",
                stats.progress_ratio() * 100.0,
                format_bytes(stats.bytes_transferred),
                format_bytes(stats.bytes_total),
            );
            use std::io::Write;
            let _ = std::io::stdout().flush();
        })),
        Some(Arc::new(|result: &Result<teleport::TransferStats>| {
            println!();
            match result {
                Ok(stats) => println!(
                    "수신 완료: 파일 {}개, {}",
                    stats.files_completed,
                    format_bytes(stats.bytes_transferred)
                ),
                Err(e) => println!("수신 실패: {e}"),
            }
        })),
    )?;

    // 탐색도 함께 켜서 상대가 이 장치를 찾을 수 있게 한다
    engine.start_discovery(Arc::new(|_: Device| {}), None)?;

    println!(
        "수신 대기 중: {}:{} (Ctrl+C로 종료)",
        engine.local_ip(),
        engine.control_port()
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    println!("\n종료 중...");

    engine.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if std::env::var("TELEPORT_DEBUG").is_ok() {
            Level::DEBUG
        } else {
            Level::WARN
        })
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("로거 초기화 실패");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("에러: {e}");
            eprintln!("도움말: teleport help");
            return ExitCode::from(1);
        }
    };

    let result = match command {
        Command::Discover { timeout_secs } => run_discover(timeout_secs).await,
        Command::Send { files, to, port } => run_send(files, to, port).await,
        Command::Receive {
            output,
            auto_accept,
        } => run_receive(output, auto_accept).await,
        Command::Version => {
            println!(
                "teleport {} (protocol v{PROTOCOL_VERSION})",
                env!("CARGO_PKG_VERSION")
            );
            Ok(())
        }
        Command::Help => {
            print_help();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("에러: {e}");
            ExitCode::from(1)
        }
    }
}
