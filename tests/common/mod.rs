#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use swft::{
    Config, DownloadEngine, LossModel, LossySocket, Role, TimeoutScheduler, TransferHandle,
    TransferLink, TransportChannel, UploadEngine,
};

/// 루프백 테스트용 빠른 설정
pub fn test_config() -> Config {
    Config {
        max_packet_size: 524,
        send_window: 8,
        receive_window: 8,
        retransmit_timeout_ms: 50,
        recv_poll_ms: 20,
        pause_poll_ms: 10,
        linger_ms: 100,
        idle_timeout_ms: 5_000,
        request_retry: swft::RetryPolicy::fixed(5, 200),
        ..Config::default()
    }
}

pub fn started_scheduler() -> TimeoutScheduler {
    let scheduler = TimeoutScheduler::default();
    scheduler.start().unwrap();
    scheduler
}

/// 결정적인 테스트 데이터
pub fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 + i / 251) as u8).collect::<Vec<u8>>())
}

/// 업로드 엔진(개시자) + 다운로드 엔진(응답자) 한 쌍
pub struct EnginePair {
    pub upload: UploadEngine,
    pub download: DownloadEngine,
    pub sender_socket: Arc<LossySocket>,
    pub destination: PathBuf,
    pub dir: tempfile::TempDir,
}

pub fn engine_pair(
    config: &Config,
    scheduler: &TimeoutScheduler,
    data: Bytes,
    loss: LossModel,
    start_id: u32,
) -> EnginePair {
    let codec = config.codec();
    let sender_socket = Arc::new(LossySocket::bind("127.0.0.1:0", loss).unwrap());
    let sender_channel = TransportChannel::from_datagram(sender_socket.clone(), codec).unwrap();
    let receiver_channel = TransportChannel::bind("127.0.0.1:0", codec).unwrap();

    let sender_addr: SocketAddr = sender_channel.local_addr();
    let receiver_addr: SocketAddr = receiver_channel.local_addr();

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("received.bin");

    let download = DownloadEngine::new(
        config.clone(),
        scheduler.clone(),
        TransferLink::new(1, Role::Responder, receiver_channel, sender_addr).with_start_id(start_id),
        data.len() as u64,
        &destination,
    )
    .unwrap();
    let upload = UploadEngine::new(
        config.clone(),
        scheduler.clone(),
        TransferLink::new(1, Role::Initiator, sender_channel, receiver_addr).with_start_id(start_id),
        data,
    )
    .unwrap();

    EnginePair {
        upload,
        download,
        sender_socket,
        destination,
        dir,
    }
}

/// 조건이 참이 될 때까지 대기
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn join_both(upload: TransferHandle, download: TransferHandle) -> (swft::TransferReport, swft::TransferReport) {
    let sent = upload.join().unwrap();
    let received = download.join().unwrap();
    (sent, received)
}
