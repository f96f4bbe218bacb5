mod common;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use swft::{
    Config, LossModel, Role, TransferId, TransferLink, TransferObserver, TransportChannel,
    UploadEngine,
};

use common::*;

#[test]
fn test_lossless_transfer_matches_source() {
    let config = test_config();
    let scheduler = started_scheduler();
    let data = pattern(10_000);

    let pair = engine_pair(&config, &scheduler, data.clone(), LossModel::default(), 17);
    let download = pair.download.spawn().unwrap();
    let upload = pair.upload.spawn().unwrap();
    let (sent, received) = join_both(upload, download);

    assert!(sent.completed);
    assert!(received.completed);
    assert_eq!(received.bytes, 10_000);
    assert_eq!(received.dropped, 0);
    assert_eq!(std::fs::read(&pair.destination).unwrap(), &data[..]);

    scheduler.stop().unwrap();
}

#[test]
fn test_ten_percent_data_loss_still_delivers_exact_file() {
    // 기본 재전송 임계값(25%) 그대로
    let config = test_config();
    assert_eq!(config.resend_threshold_percent, Config::default().resend_threshold_percent);
    let scheduler = started_scheduler();
    let data = pattern(100_000);

    let loss = LossModel::lossy(0.10, 42).data_only();
    let pair = engine_pair(&config, &scheduler, data.clone(), loss, 3);
    let socket = pair.sender_socket.clone();
    let download = pair.download.spawn().unwrap();
    let upload = pair.upload.spawn().unwrap();
    let (sent, received) = join_both(upload, download);

    assert!(sent.completed);
    assert!(received.completed);
    assert_eq!(std::fs::read(&pair.destination).unwrap(), &data[..]);
    // 드롭된 프레임은 모두 재전송으로 복구됨
    assert!(socket.dropped() > 0);
    assert!(sent.resent >= socket.dropped());
    // 손실 하나에 재전송 하나: 윈도우 전체를 다시 보내지 않음
    let packets = config.packets_for(data.len() as u64);
    assert!(sent.resent * 100 / packets <= config.resend_threshold_percent);

    scheduler.stop().unwrap();
}

#[test]
fn test_small_id_space_wraps_many_times() {
    let config = Config {
        max_packet_size: 32 + swft::HEADER_SIZE,
        max_id: 16,
        send_window: 4,
        receive_window: 4,
        ..test_config()
    };
    let scheduler = started_scheduler();
    let data = pattern(2_000);

    let loss = LossModel::lossy(0.05, 7).data_only();
    let pair = engine_pair(&config, &scheduler, data.clone(), loss, 13);
    let download = pair.download.spawn().unwrap();
    let upload = pair.upload.spawn().unwrap();
    let (sent, received) = join_both(upload, download);

    assert!(sent.completed);
    assert!(received.completed);
    assert_eq!(std::fs::read(&pair.destination).unwrap(), &data[..]);

    scheduler.stop().unwrap();
}

#[test]
fn test_resend_ratio_abort_without_acks() {
    let config = Config {
        max_packet_size: 100 + swft::HEADER_SIZE,
        resend_threshold_percent: 25,
        ..test_config()
    };
    let scheduler = started_scheduler();

    // ACK를 보내지 않는 피어
    let silent = TransportChannel::bind("127.0.0.1:0", config.codec()).unwrap();
    let channel = TransportChannel::bind("127.0.0.1:0", config.codec()).unwrap();
    let link = TransferLink::new(9, Role::Initiator, channel, silent.local_addr());
    let engine = UploadEngine::new(config, scheduler.clone(), link, pattern(400)).unwrap();
    assert_eq!(engine.total_packets(), 4);

    let report = engine.spawn().unwrap().join().unwrap();

    // 4 패킷 기준: 1회 = 25% (통과), 2회 = 50% (중단)
    assert!(!report.completed);
    assert_eq!(report.resent, 2);
    assert!(wait_until(Duration::from_secs(2), || scheduler.pending() == 0));

    scheduler.stop().unwrap();
}

#[test]
fn test_zero_byte_transfer_completes_immediately() {
    let config = test_config();
    let scheduler = started_scheduler();

    let pair = engine_pair(&config, &scheduler, bytes::Bytes::new(), LossModel::default(), 0);
    let download = pair.download.spawn().unwrap();
    let upload = pair.upload.spawn().unwrap();
    let (sent, received) = join_both(upload, download);

    assert!(sent.completed);
    assert!(received.completed);
    assert_eq!(std::fs::read(&pair.destination).unwrap().len(), 0);

    scheduler.stop().unwrap();
}

/// 첫 진행 보고에서 테스트가 일시정지를 건 뒤 풀어줄 때까지 엔진을 붙잡는 관찰자
struct Gate {
    gate: Mutex<Option<(Sender<u64>, Receiver<()>)>>,
}

impl TransferObserver for Gate {
    fn on_progress(&self, _id: TransferId, bytes_done: u64, _total_bytes: u64) {
        let gate = self.gate.lock().take();
        if let Some((notify, release)) = gate {
            notify.send(bytes_done).unwrap();
            release.recv().unwrap();
        }
    }
}

#[test]
fn test_pause_freezes_progress_and_resume_completes() {
    let config = test_config();
    let scheduler = started_scheduler();
    let data = pattern(20 * 512);

    let (notify_tx, notify_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let gate = Arc::new(Gate {
        gate: Mutex::new(Some((notify_tx, release_rx))),
    });

    let pair = engine_pair(&config, &scheduler, data.clone(), LossModel::default(), 5);
    let download = pair.download.with_observer(gate).spawn().unwrap();
    let upload = pair.upload.spawn().unwrap();

    let frozen = notify_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    download.pause().unwrap();
    release_tx.send(()).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(download.bytes_done(), frozen);
    assert!(!download.is_finished());
    assert!(!upload.is_finished());

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(download.bytes_done(), frozen);

    download.resume().unwrap();
    let (sent, received) = join_both(upload, download);

    assert!(sent.completed);
    assert!(received.completed);
    assert_eq!(std::fs::read(&pair.destination).unwrap(), &data[..]);

    scheduler.stop().unwrap();
}

#[test]
fn test_stop_leaves_transfer_incomplete() {
    let config = test_config();
    let scheduler = started_scheduler();

    // 송신측이 없는 수신 엔진
    let pair = engine_pair(&config, &scheduler, pattern(5_000), LossModel::default(), 0);
    let download = pair.download.spawn().unwrap();
    download.stop().unwrap();

    let report = download.join().unwrap();
    assert!(!report.completed);
    assert!(!pair.destination.exists());

    scheduler.stop().unwrap();
}
