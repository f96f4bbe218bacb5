//! 송신 엔진 (업로드)
//!
//! - 고정 크기 송신 윈도우 `(LAR, LAR + SWS]`
//! - 누적 ACK로 LAR 전진
//! - 프레임별 재전송 타이머 ([`TimeoutScheduler`])
//! - 수신측 요청에 따른 일시정지/재개
//! - 재전송 비율이 임계값을 넘으면 중단

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::channel::TransportChannel;
use crate::frame::Frame;
use crate::message::ControlToken;
use crate::policy::{Backoff, ResendPolicy, Verdict};
use crate::sequence::SequenceSpace;
use crate::stats::{TransferReport, TransferStats};
use crate::timer::{TimeoutHandler, TimeoutScheduler};
use crate::transfer::{
    Direction, EngineCmd, Progress, Role, SilentObserver, TransferHandle, TransferId,
    TransferLink, TransferObserver,
};
use crate::{Config, Error, Result};

/// 송신 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    /// 응답자: 수신측 `START` 대기
    AwaitingStart,

    /// 윈도우를 채우며 전송 중
    Sending,

    /// 모든 패킷 전송, ACK 대기
    Draining,

    Complete,

    Aborted,
}

impl SendPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SendPhase::Complete | SendPhase::Aborted)
    }
}

/// 송신 윈도우 (엔진 락 안에서만 접근)
struct SendWindow {
    phase: SendPhase,
    paused: bool,
    space: SequenceSpace,

    /// 마지막으로 ACK된 번호 (-1 = 없음)
    lar: i64,

    /// 다음에 처음 보낼 번호
    next: u64,

    /// 전송했지만 ACK되지 않은 프레임
    in_flight: BTreeMap<u64, Frame>,

    stats: TransferStats,

    last_heard: Instant,
}

/// 엔진 공유 상태. 엔진 스레드와 타이머 스레드가 함께 사용한다
struct UploadShared {
    me: Weak<UploadShared>,
    id: TransferId,
    config: Config,
    channel: TransportChannel,
    peer: SocketAddr,
    scheduler: TimeoutScheduler,
    data: Bytes,
    total_packets: u64,
    policy: ResendPolicy,
    window: Mutex<SendWindow>,
    progress: Arc<Progress>,
    observer: RwLock<Arc<dyn TransferObserver>>,
}

/// 프레임 하나의 재전송 타이머
struct Retransmit {
    engine: Weak<UploadShared>,
    number: u64,
}

impl TimeoutHandler for Retransmit {
    fn on_timeout(&self, tag: Frame) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_retransmit_timeout(self.number, tag);
        }
    }
}

impl UploadShared {
    fn handle_command(&self, cmd: EngineCmd) {
        let mut window = self.window.lock();
        if window.phase.is_terminal() {
            return;
        }
        match cmd {
            EngineCmd::Pause => self.pause(&mut window),
            EngineCmd::Resume => self.resume(&mut window),
            EngineCmd::Stop => {
                info!("Upload {} stopped by request", self.id);
                self.abort(&mut window);
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let progressed = {
            let mut window = self.window.lock();
            if window.phase.is_terminal() {
                return;
            }
            window.stats.frames_received += 1;
            window.last_heard = Instant::now();

            match ControlToken::from_frame(&frame) {
                Some(ControlToken::Ack) => self.on_ack(&mut window, frame.sequence_id),
                Some(ControlToken::Start) => {
                    self.on_start(&mut window, frame.sequence_id);
                    None
                }
                Some(ControlToken::Pause) => {
                    self.pause(&mut window);
                    self.reply_ack(&window);
                    None
                }
                Some(ControlToken::Resume) => {
                    self.reply_ack(&window);
                    self.resume(&mut window);
                    None
                }
                _ => {
                    let err =
                        Error::Protocol(format!("예상하지 못한 프레임: id={}", frame.sequence_id));
                    warn!("Upload {}: {}", self.id, err);
                    None
                }
            }
        };

        // 관찰자는 락 밖에서 호출
        if let Some(done) = progressed {
            self.observer.read().on_progress(self.id, done, self.data.len() as u64);
        }
    }

    /// 응답자: 수신측이 고른 시작 id를 채택하고 전송 시작
    fn on_start(&self, window: &mut SendWindow, start_id: u32) {
        if window.phase != SendPhase::AwaitingStart {
            debug!("Upload {}: 중복 START 무시", self.id);
            return;
        }
        window.space = SequenceSpace::new(start_id, self.config.max_id);
        window.phase = SendPhase::Sending;
        if !window.paused {
            window.stats.start_clock();
        }
        info!("Upload {} START received (start_id={})", self.id, start_id);
        self.fill_window(window);
    }

    /// 누적 ACK: 번호 이하의 모든 프레임 확인
    ///
    /// LAR이 전진하면 새 진행 바이트 수를 돌려준다.
    fn on_ack(&self, window: &mut SendWindow, wire: u32) -> Option<u64> {
        let highest_sent = window.next as i64 - 1;
        let Some(number) = window.space.acked_number(wire, window.lar, highest_sent) else {
            debug!("Upload {}: 오래된 ACK 무시 (wire={})", self.id, wire);
            return None;
        };

        let unacked = window.in_flight.split_off(&(number as u64 + 1));
        window.in_flight = unacked;
        window.lar = number;

        let payload = self.config.max_payload_len() as u64;
        let done = ((number as u64 + 1) * payload).min(self.data.len() as u64);
        window.stats.bytes_done = done;
        self.progress.set_done(done);

        if window.lar + 1 == self.total_packets as i64 {
            self.complete(window);
        } else {
            self.fill_window(window);
        }
        Some(done)
    }

    /// `(LAR, LAR + SWS]` 중 아직 보내지 않은 번호를 모두 전송
    fn fill_window(&self, window: &mut SendWindow) {
        if window.paused || window.phase != SendPhase::Sending {
            return;
        }

        let payload = self.config.max_payload_len() as u64;
        let limit = window.lar + self.config.send_window as i64;

        while window.next < self.total_packets && window.next as i64 <= limit {
            let number = window.next;
            let start = (number * payload) as usize;
            let end = (start + payload as usize).min(self.data.len());

            let wire = window.space.assign(number);
            let frame = Frame::data(wire, self.data.slice(start..end));
            if let Err(e) = self.channel.send(&frame, self.peer) {
                warn!("Upload {}: 전송 실패 (number={}): {}", self.id, number, e);
            }

            window.stats.frames_sent += 1;
            window.in_flight.insert(number, frame.clone());
            self.arm(number, frame);
            window.next += 1;
        }

        if window.next == self.total_packets {
            window.phase = SendPhase::Draining;
            debug!(
                "Upload {}: 모든 패킷 전송, ACK 대기 (wraps={})",
                self.id,
                window.space.wrap_count()
            );
        }
    }

    fn on_retransmit_timeout(&self, number: u64, frame: Frame) {
        let mut window = self.window.lock();
        if window.phase.is_terminal() {
            return;
        }
        match window.in_flight.get(&number) {
            Some(in_flight) if !in_flight.ack => {}
            _ => return,
        }

        // 일시정지 중에는 재전송 없이 타이머만 유지
        if window.paused {
            self.arm(number, frame);
            return;
        }

        // 가장 낮은 미확인 프레임만 재전송. 나머지는 누적 ACK를 기다리며 한 RTO 미룸
        if number as i64 != window.lar + 1 {
            self.arm(number, frame);
            return;
        }

        if let Err(e) = self.channel.send(&frame, self.peer) {
            debug!("Upload {}: 재전송 실패 (number={}): {}", self.id, number, e);
        }
        window.stats.resent += 1;
        debug!(
            "Upload {}: 재전송 number={} wire={}",
            self.id, number, frame.sequence_id
        );

        match self.policy.record_resend() {
            Verdict::Continue => self.arm(number, frame),
            Verdict::Abort { ratio } => {
                if let Some(in_flight) = window.in_flight.get_mut(&number) {
                    in_flight.ack = true;
                }
                warn!(
                    "Upload {} aborted: resend ratio {}% > {}%",
                    self.id, ratio, self.config.resend_threshold_percent
                );
                self.abort(&mut window);
            }
        }
    }

    fn arm(&self, number: u64, frame: Frame) {
        let handler = Arc::new(Retransmit {
            engine: self.me.clone(),
            number,
        });
        self.scheduler
            .schedule(self.config.retransmit_timeout(), handler, frame);
    }

    fn pause(&self, window: &mut SendWindow) {
        if !window.paused {
            window.paused = true;
            window.stats.pause_clock();
            info!("Upload {} paused", self.id);
        }
    }

    fn resume(&self, window: &mut SendWindow) {
        if window.paused {
            window.paused = false;
            if window.phase != SendPhase::AwaitingStart {
                window.stats.resume_clock();
            }
            info!("Upload {} resumed", self.id);
        }
        self.fill_window(window);
    }

    /// pause/resume 응답: 현재 LAR을 담은 ACK
    fn reply_ack(&self, window: &SendWindow) {
        let ack = ControlToken::Ack.frame(window.space.wire_id(window.lar));
        if let Err(e) = self.channel.send(&ack, self.peer) {
            debug!("Upload {}: ACK 응답 실패: {}", self.id, e);
        }
    }

    fn complete(&self, window: &mut SendWindow) {
        window.phase = SendPhase::Complete;
        window.stats.bytes_done = self.data.len() as u64;
        window.stats.pause_clock();
        self.progress.set_done(self.data.len() as u64);
    }

    fn abort(&self, window: &mut SendWindow) {
        window.phase = SendPhase::Aborted;
        window.stats.pause_clock();
        self.channel.close();
    }

    fn phase(&self) -> SendPhase {
        self.window.lock().phase
    }

    /// 유휴 시간 초과 여부 (일시정지 중 제외)
    fn idle_expired(&self) -> bool {
        let window = self.window.lock();
        !window.paused && window.last_heard.elapsed() > self.config.idle_timeout()
    }

    fn finish(&self) -> TransferReport {
        let report = {
            let mut window = self.window.lock();
            if !window.phase.is_terminal() {
                window.phase = SendPhase::Aborted;
            }
            window.stats.pause_clock();
            window.stats.report(window.phase == SendPhase::Complete)
        };
        self.channel.close();
        self.progress.finish();

        if report.completed {
            info!("Upload {} complete\n{}", self.id, report);
        } else {
            warn!("Upload {} INCOMPLETE\n{}", self.id, report);
        }
        self.observer.read().on_finished(&report);
        report
    }
}

/// 업로드 엔진
///
/// 파일 전체를 메모리에 올려 패킷 단위로 잘라 보낸다.
pub struct UploadEngine {
    shared: Arc<UploadShared>,
    commands: Receiver<EngineCmd>,
    command_tx: Sender<EngineCmd>,
}

impl UploadEngine {
    /// 새 업로드 엔진 생성
    ///
    /// 개시자는 `link.start_id`(상대가 알려준 값)부터 바로 보내고,
    /// 응답자는 `START` 프레임을 받을 때까지 기다린다.
    pub fn new(
        config: Config,
        scheduler: TimeoutScheduler,
        link: TransferLink,
        data: Bytes,
    ) -> Result<Self> {
        config.validate()?;
        if link.start_id >= config.max_id {
            return Err(Error::Protocol(format!(
                "start_id({}) >= max_id({})",
                link.start_id, config.max_id
            )));
        }

        let total_packets = config.packets_for(data.len() as u64);
        let phase = match link.role {
            Role::Initiator => SendPhase::Sending,
            Role::Responder => SendPhase::AwaitingStart,
        };
        let window = SendWindow {
            phase,
            paused: false,
            space: SequenceSpace::new(link.start_id, config.max_id),
            lar: -1,
            next: 0,
            in_flight: BTreeMap::new(),
            stats: TransferStats::new(
                link.id,
                Direction::Upload,
                data.len() as u64,
                total_packets,
            ),
            last_heard: Instant::now(),
        };

        let (command_tx, commands) = crossbeam_channel::unbounded();
        let shared = Arc::new_cyclic(|me| UploadShared {
            me: me.clone(),
            id: link.id,
            policy: ResendPolicy::new(config.resend_threshold_percent, total_packets),
            progress: Arc::new(Progress::new(data.len() as u64)),
            observer: RwLock::new(Arc::new(SilentObserver)),
            config,
            channel: link.channel,
            peer: link.peer,
            scheduler,
            data,
            total_packets,
            window: Mutex::new(window),
        });

        Ok(Self {
            shared,
            commands,
            command_tx,
        })
    }

    /// 진행 콜백 등록
    pub fn with_observer(self, observer: Arc<dyn TransferObserver>) -> Self {
        *self.shared.observer.write() = observer;
        self
    }

    pub fn id(&self) -> TransferId {
        self.shared.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.channel.local_addr()
    }

    pub fn total_packets(&self) -> u64 {
        self.shared.total_packets
    }

    /// 전용 스레드에서 실행
    pub fn spawn(self) -> Result<TransferHandle> {
        let id = self.shared.id;
        let progress = self.shared.progress.clone();
        let commands = self.command_tx.clone();
        let worker = std::thread::Builder::new()
            .name(format!("swft-upload-{id}"))
            .spawn(move || self.run())?;
        Ok(TransferHandle::new(
            id,
            Direction::Upload,
            commands,
            progress,
            worker,
        ))
    }

    /// 현재 스레드에서 전송이 끝날 때까지 실행
    pub fn run(self) -> Result<TransferReport> {
        let shared = self.shared;
        info!(
            "Upload {} started: {} bytes in {} packets → {}",
            shared.id,
            shared.data.len(),
            shared.total_packets,
            shared.peer
        );

        {
            let mut window = shared.window.lock();
            if shared.total_packets == 0 {
                shared.complete(&mut window);
            } else if window.phase == SendPhase::Sending {
                window.stats.start_clock();
                shared.fill_window(&mut window);
            }
        }

        let mut backoff = Backoff::new(shared.config.error_backoff.clone());
        loop {
            while let Ok(cmd) = self.commands.try_recv() {
                shared.handle_command(cmd);
            }
            if shared.phase().is_terminal() {
                break;
            }
            if shared.idle_expired() {
                warn!("Upload {}: 피어 응답 없음", shared.id);
                break;
            }

            match shared.channel.receive(shared.config.recv_poll()) {
                Ok((frame, from)) => {
                    backoff.reset();
                    if from != shared.peer {
                        debug!("Upload {}: 다른 주소의 프레임 드롭: {}", shared.id, from);
                        continue;
                    }
                    shared.handle_frame(frame);
                }
                Err(Error::Timeout) => {}
                Err(Error::ChannelClosed) => break,
                Err(Error::Frame(e)) => {
                    warn!("Upload {}: 잘못된 데이터그램 드롭: {}", shared.id, e);
                }
                Err(e) => {
                    warn!("Upload {}: 수신 에러: {}", shared.id, e);
                    match backoff.next_delay() {
                        Some(delay) => std::thread::sleep(delay),
                        None => break,
                    }
                }
            }
        }

        Ok(shared.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameCodec;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            max_packet_size: 16 + crate::HEADER_SIZE,
            max_id: 10,
            send_window: 3,
            receive_window: 3,
            retransmit_timeout_ms: 60_000,
            recv_poll_ms: 20,
            ..Config::default()
        }
    }

    /// 엔진 + 피어 역할을 하는 채널
    fn engine(config: Config, role: Role, start_id: u32, len: usize) -> (UploadEngine, TransportChannel) {
        let codec = FrameCodec::new(config.max_packet_size, config.max_id);
        let peer = TransportChannel::bind("127.0.0.1:0", codec).unwrap();
        let channel = TransportChannel::bind("127.0.0.1:0", codec).unwrap();
        let link = TransferLink::new(7, role, channel, peer.local_addr()).with_start_id(start_id);
        let data = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>());
        let engine = UploadEngine::new(config, TimeoutScheduler::default(), link, data).unwrap();
        (engine, peer)
    }

    fn sent_ids(peer: &TransportChannel) -> Vec<u32> {
        let mut ids = Vec::new();
        while let Ok((frame, _)) = peer.receive(Duration::from_millis(50)) {
            ids.push(frame.sequence_id);
        }
        ids
    }

    #[test]
    fn test_fill_window_sends_at_most_sws() {
        let (engine, peer) = engine(config(), Role::Initiator, 8, 16 * 5);
        let shared = engine.shared.clone();
        {
            let mut window = shared.window.lock();
            shared.fill_window(&mut window);
            assert_eq!(window.next, 3);
            assert_eq!(window.in_flight.len(), 3);
        }
        assert_eq!(sent_ids(&peer), vec![8, 9, 0]);
    }

    #[test]
    fn test_cumulative_ack_slides_window_across_wrap() {
        let (engine, peer) = engine(config(), Role::Initiator, 8, 16 * 5);
        let shared = engine.shared.clone();
        {
            let mut window = shared.window.lock();
            shared.fill_window(&mut window);
            // 번호 1 (wire 9)까지 누적 ACK
            shared.on_ack(&mut window, 9);
            assert_eq!(window.lar, 1);
            assert_eq!(window.in_flight.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
            assert_eq!(window.phase, SendPhase::Draining);
            assert_eq!(window.space.wrap_count(), 1);

            // 오래된 ACK는 무시
            shared.on_ack(&mut window, 8);
            assert_eq!(window.lar, 1);

            shared.on_ack(&mut window, 2);
            assert_eq!(window.phase, SendPhase::Complete);
            assert_eq!(window.stats.bytes_done, 80);
        }
        assert_eq!(sent_ids(&peer), vec![8, 9, 0, 1, 2]);
    }

    #[test]
    fn test_responder_adopts_start_id() {
        let (engine, peer) = engine(config(), Role::Responder, 0, 20);
        let shared = engine.shared.clone();
        {
            let mut window = shared.window.lock();
            assert_eq!(window.phase, SendPhase::AwaitingStart);
            shared.fill_window(&mut window);
            assert_eq!(window.next, 0);

            shared.on_start(&mut window, 4);
            assert_eq!(window.phase, SendPhase::Draining);
        }
        assert_eq!(sent_ids(&peer), vec![4, 5]);
    }

    #[test]
    fn test_pause_suppresses_sending_and_replies_ack() {
        let (engine, peer) = engine(config(), Role::Initiator, 0, 16 * 6);
        let shared = engine.shared.clone();

        shared.handle_frame(ControlToken::Pause.frame(0));
        let (reply, _) = peer.receive(Duration::from_secs(1)).unwrap();
        assert_eq!(ControlToken::from_frame(&reply), Some(ControlToken::Ack));
        assert_eq!(reply.sequence_id, 9); // wire_id(LAR = -1)
        {
            let mut window = shared.window.lock();
            shared.fill_window(&mut window);
            assert_eq!(window.next, 0);
        }

        shared.handle_frame(ControlToken::Resume.frame(0));
        let ids = sent_ids(&peer);
        assert_eq!(ids, vec![9, 0, 1, 2]); // ACK 응답 + 데이터 3개
    }

    #[test]
    fn test_resend_ratio_abort_stops_timers() {
        let config = Config {
            resend_threshold_percent: 25,
            ..config()
        };
        let (engine, _peer) = engine(config, Role::Initiator, 0, 16 * 4);
        let shared = engine.shared.clone();
        {
            let mut window = shared.window.lock();
            shared.fill_window(&mut window);
        }

        let first = shared.window.lock().in_flight.get(&0).cloned().unwrap();
        shared.on_retransmit_timeout(0, first.clone());
        assert_eq!(shared.phase(), SendPhase::Sending);
        shared.on_retransmit_timeout(0, first.clone());
        assert_eq!(shared.phase(), SendPhase::Aborted);
        assert!(shared.window.lock().in_flight[&0].ack);
        assert_eq!(shared.policy.resends(), 2);

        // 중단 후 타이머는 아무것도 하지 않음
        shared.on_retransmit_timeout(1, first);
        assert_eq!(shared.policy.resends(), 2);
        assert!(shared.channel.is_closed());
    }

    #[test]
    fn test_paused_timer_rearms_without_counting() {
        let (engine, _peer) = engine(config(), Role::Initiator, 0, 16 * 4);
        let shared = engine.shared.clone();
        let frame = {
            let mut window = shared.window.lock();
            shared.fill_window(&mut window);
            shared.pause(&mut window);
            window.in_flight[&0].clone()
        };
        let armed = shared.scheduler.pending();

        shared.on_retransmit_timeout(0, frame);
        assert_eq!(shared.policy.resends(), 0);
        assert_eq!(shared.scheduler.pending(), armed + 1);
    }

    #[test]
    fn test_only_lowest_unacked_frame_is_resent() {
        let (engine, peer) = engine(config(), Role::Initiator, 0, 16 * 4);
        let shared = engine.shared.clone();
        let (first, third) = {
            let mut window = shared.window.lock();
            shared.fill_window(&mut window);
            (window.in_flight[&0].clone(), window.in_flight[&2].clone())
        };
        assert_eq!(sent_ids(&peer), vec![0, 1, 2]);
        let armed = shared.scheduler.pending();

        // 번호 0이 손실된 경우: 2의 타이머는 재전송 없이 다시 등록
        shared.on_retransmit_timeout(2, third);
        assert_eq!(shared.policy.resends(), 0);
        assert_eq!(shared.scheduler.pending(), armed + 1);

        shared.on_retransmit_timeout(0, first);
        assert_eq!(shared.policy.resends(), 1);
        assert_eq!(sent_ids(&peer), vec![0]);

        // 0의 재전송 후 0..=2 누적 ACK: 남은 타이머는 아무것도 하지 않음
        let mut window = shared.window.lock();
        shared.on_ack(&mut window, 2);
        assert_eq!(window.lar, 2);
        assert_eq!(window.in_flight.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(window.stats.resent, 1);
    }

    /// 진행 보고 시점에 엔진 락이 풀려 있는지 기록
    struct LockCheck {
        engine: Mutex<Weak<UploadShared>>,
        unlocked: Mutex<Vec<bool>>,
    }

    impl TransferObserver for LockCheck {
        fn on_progress(&self, _id: TransferId, _done: u64, _total: u64) {
            if let Some(engine) = self.engine.lock().upgrade() {
                self.unlocked.lock().push(engine.window.try_lock().is_some());
            }
        }
    }

    #[test]
    fn test_progress_observer_runs_outside_engine_lock() {
        let (engine, _peer) = engine(config(), Role::Initiator, 0, 16 * 2);
        let observer = Arc::new(LockCheck {
            engine: Mutex::new(Weak::new()),
            unlocked: Mutex::new(Vec::new()),
        });
        let engine = engine.with_observer(observer.clone());
        let shared = engine.shared.clone();
        *observer.engine.lock() = Arc::downgrade(&shared);
        {
            let mut window = shared.window.lock();
            shared.fill_window(&mut window);
        }

        shared.handle_frame(ControlToken::Ack.frame(0));
        shared.handle_frame(ControlToken::Ack.frame(1));
        assert_eq!(*observer.unlocked.lock(), vec![true, true]);
        assert_eq!(shared.phase(), SendPhase::Complete);
    }

    #[test]
    fn test_empty_file_completes_immediately() {
        let (engine, _peer) = engine(config(), Role::Responder, 0, 0);
        let report = engine.run().unwrap();
        assert!(report.completed);
        assert_eq!(report.bytes, 0);
    }
}
