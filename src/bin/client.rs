//! SWFT 클라이언트 - Sliding Window File Transfer
//!
//! 서버와 핸드쉐이크 후 세션 명령을 보낸다. 명령 옵션이 있으면 하나만 실행하고
//! 끝나며, 없으면 표준 입력에서 명령을 읽는다.
//!
//! 사용법:
//!   cargo run --release --bin swft-client -- [OPTIONS]
//!
//! 예시:
//!   # 원격 파일 목록
//!   cargo run --release --bin swft-client -- --server 127.0.0.1:9000 --list
//!
//!   # 다운로드
//!   cargo run --release --bin swft-client -- -s 127.0.0.1:9000 --get data.bin -o ./data.bin
//!
//!   # 대화형
//!   cargo run --release --bin swft-client -- -s 127.0.0.1:9000

use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swft::{
    ClientController, Config, TimeoutScheduler, TransferId, TransferObserver, TransferReport,
};

/// 단발 명령
enum Action {
    List,
    Get { name: String, output: Option<PathBuf> },
    Put { path: PathBuf, name: Option<String> },
    Delete { name: String },
}

/// 클라이언트 설정
struct ClientConfig {
    server_addr: SocketAddr,
    action: Option<Action>,
    output: Option<PathBuf>,
    remote_name: Option<String>,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            action: None,
            output: None,
            remote_name: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--list" | "-l" => config.action = Some(Action::List),
            "--get" | "-g" => {
                if i + 1 < args.len() {
                    config.action = Some(Action::Get {
                        name: args[i + 1].clone(),
                        output: None,
                    });
                    i += 1;
                }
            }
            "--put" | "-p" => {
                if i + 1 < args.len() {
                    config.action = Some(Action::Put {
                        path: PathBuf::from(&args[i + 1]),
                        name: None,
                    });
                    i += 1;
                }
            }
            "--delete" => {
                if i + 1 < args.len() {
                    config.action = Some(Action::Delete {
                        name: args[i + 1].clone(),
                    });
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    config.remote_name = Some(args[i + 1].clone());
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
            "--help" | "-h" => {
                println!(
                    r#"SWFT Client - Sliding Window File Transfer 클라이언트

사용법:
  cargo run --release --bin swft-client -- [OPTIONS]

옵션:
  -s, --server <ADDR>     서버 랑데부 주소 (기본: 127.0.0.1:9000)
  -l, --list              원격 파일 목록
  -g, --get <NAME>        원격 파일 다운로드
  -o, --output <PATH>     다운로드 저장 경로 (기본: 원격 이름)
  -p, --put <PATH>        로컬 파일 업로드
  -n, --name <NAME>       업로드할 원격 이름 (기본: 로컬 파일 이름)
  --delete <NAME>         원격 파일 삭제
  -c, --config <PATH>     TOML 설정 파일
  --preset <NAME>         설정 프리셋: default | lan | lossy
  -h, --help              이 도움말 출력

명령 옵션이 없으면 대화형 모드:
  ls | get <name> [path] | put <path> [name] | rm <name>
  pause <id> | resume <id> | wait <id> | status | exit
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    // -o / -n은 명령 옵션 순서와 무관하게 적용
    match config.action.as_mut() {
        Some(Action::Get { output, .. }) => *output = config.output.take(),
        Some(Action::Put { name, .. }) => *name = config.remote_name.take(),
        _ => {}
    }

    config
}

/// 10% 단위로 진행 상황 로그
struct ProgressLog {
    last_decile: AtomicU64,
}

impl TransferObserver for ProgressLog {
    fn on_progress(&self, id: TransferId, bytes_done: u64, total_bytes: u64) {
        let decile = bytes_done * 10 / total_bytes.max(1);
        if self.last_decile.swap(decile, Ordering::Relaxed) != decile {
            info!("Transfer {}: {}/{} bytes ({}%)", id, bytes_done, total_bytes, decile * 10);
        }
    }

    fn on_finished(&self, report: &TransferReport) {
        println!("{}", report);
    }
}

fn remote_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn run_action(client: &mut ClientController, action: Action) -> swft::Result<()> {
    match action {
        Action::List => {
            for name in client.list()? {
                println!("{name}");
            }
        }
        Action::Get { name, output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(&name));
            let id = client.download(&name, output)?;
            client.wait(id)?;
        }
        Action::Put { path, name } => {
            let name = name.unwrap_or_else(|| remote_name(&path));
            let id = client.upload(&path, &name)?;
            client.wait(id)?;
        }
        Action::Delete { name } => client.delete(&name)?,
    }
    Ok(())
}

/// 대화형 명령 한 줄 처리. `exit`이면 false
fn run_line(client: &mut ClientController, line: &str) -> swft::Result<bool> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let transfer_id = |word: &str| -> swft::Result<TransferId> {
        word.parse::<TransferId>()
            .map_err(|_| swft::Error::Protocol(format!("전송 id가 아님: {word}")))
    };

    match words.as_slice() {
        [] => {}
        ["ls"] => run_action(client, Action::List)?,
        ["get", name] => {
            let id = client.download(name, PathBuf::from(name))?;
            println!("transfer {id} started");
        }
        ["get", name, path] => {
            let id = client.download(name, PathBuf::from(path))?;
            println!("transfer {id} started");
        }
        ["put", path] => {
            let id = client.upload(Path::new(path), &remote_name(Path::new(path)))?;
            println!("transfer {id} started");
        }
        ["put", path, name] => {
            let id = client.upload(Path::new(path), name)?;
            println!("transfer {id} started");
        }
        ["rm", name] => client.delete(name)?,
        ["pause", id] => client.pause(transfer_id(id)?)?,
        ["resume", id] => client.resume(transfer_id(id)?)?,
        ["wait", id] => {
            client.wait(transfer_id(id)?)?;
        }
        ["status"] => {
            for (id, direction, done, total) in client.transfers() {
                println!("{id}\t{direction}\t{done}/{total}");
            }
        }
        ["exit"] | ["quit"] => return Ok(false),
        _ => println!("알 수 없는 명령: {line}"),
    }
    Ok(true)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client_config = parse_args();
    let config = client_config.config;

    info!("SWFT Client starting...");
    info!("Server address: {}", client_config.server_addr);

    let scheduler = TimeoutScheduler::new(Duration::from_millis(config.scheduler_tick_ms));
    scheduler.start()?;

    let observer = Arc::new(ProgressLog {
        last_decile: AtomicU64::new(0),
    });
    let mut client = ClientController::connect(client_config.server_addr, config, scheduler.clone())?
        .with_observer(observer);

    match client_config.action {
        Some(action) => {
            if let Err(e) = run_action(&mut client, action) {
                warn!("명령 실패: {}", e);
            }
        }
        None => {
            let stdin = std::io::stdin();
            loop {
                print!("swft> ");
                std::io::stdout().flush()?;

                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                match run_line(&mut client, line.trim()) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("에러: {e}"),
                }
            }
        }
    }

    client.close()?;
    scheduler.stop()?;
    Ok(())
}
