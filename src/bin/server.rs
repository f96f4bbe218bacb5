//! SWFT 서버 - Sliding Window File Transfer
//!
//! 랑데부 포트에서 클라이언트 핸드쉐이크를 받고, 클라이언트마다 세션 스레드를 띄워
//! 목록/다운로드/업로드/삭제/일시정지/재개 명령을 처리한다.
//!
//! 사용법:
//!   cargo run --release --bin swft-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 실행 (./files 디렉터리 서비스)
//!   cargo run --release --bin swft-server -- --bind 0.0.0.0:9000 --dir ./files
//!
//!   # 손실이 많은 링크용 프리셋
//!   cargo run --release --bin swft-server -- --preset lossy

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use swft::{Config, DirStore, SessionAcceptor, TimeoutScheduler};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    root: PathBuf,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            root: PathBuf::from("files"),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--dir" | "-d" => {
                if i + 1 < args.len() {
                    config.root = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config = Config::load(&args[i + 1]).expect("설정 파일을 읽을 수 없음");
                    i += 1;
                }
            }
            "--preset" => {
                if i + 1 < args.len() {
                    config.config = match args[i + 1].as_str() {
                        "lan" => Config::lan(),
                        "lossy" => Config::lossy_network(),
                        _ => Config::default(),
                    };
                    i += 1;
                }
            }
            "--window" | "-w" => {
                if i + 1 < args.len() {
                    let window = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.config.send_window = window;
                    config.config.receive_window = window;
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    config.config.retransmit_timeout_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--threshold" => {
                if i + 1 < args.len() {
                    config.config.resend_threshold_percent =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"SWFT Server - Sliding Window File Transfer 서버

UDP 기반 누적 ACK 슬라이딩 윈도우 파일 전송 서버
- 클라이언트별 세션 채널, 전송별 전송 채널
- 재전송 비율이 임계값을 넘으면 전송 중단

사용법:
  cargo run --release --bin swft-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       랑데부 주소 (기본: 0.0.0.0:9000)
  -d, --dir <PATH>        서비스할 디렉터리 (기본: ./files)
  -c, --config <PATH>     TOML 설정 파일
  --preset <NAME>         설정 프리셋: default | lan | lossy
  -w, --window <N>        송신/수신 윈도우 크기 (기본: 32)
  --timeout <MS>          재전송 타임아웃 밀리초 (기본: 1000)
  --threshold <PERCENT>   재전송 비율 중단 임계값 (기본: 25)
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경변수로 조절 (기본: info)
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server_config = parse_args();
    let config = server_config.config;
    config.validate()?;

    info!("SWFT Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Max packet size: {} bytes", config.max_packet_size);
    info!("Window: SWS={} RWS={}", config.send_window, config.receive_window);
    info!("Retransmit timeout: {} ms", config.retransmit_timeout_ms);
    info!("Resend threshold: {}%", config.resend_threshold_percent);

    let store = Arc::new(DirStore::open(&server_config.root)?);

    let scheduler = TimeoutScheduler::new(std::time::Duration::from_millis(config.scheduler_tick_ms));
    scheduler.start()?;

    let acceptor = SessionAcceptor::bind(server_config.bind_addr, config, scheduler.clone(), store)?;
    let result = acceptor.serve();

    scheduler.stop()?;
    result?;
    Ok(())
}
