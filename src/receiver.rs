//! 수신 엔진 (다운로드)
//!
//! - 수신 윈도우 `(LFR, LFR + RWS]` 안의 프레임 버퍼링
//! - 연속 구간을 조립하고 새 LFR을 누적 ACK
//! - 필수 확인 제어 프레임(`START`, `pause`, `resume`) 재전송
//! - 완료 후 원자적 저장, 잠시 남아 중복 프레임에 재ACK

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::channel::TransportChannel;
use crate::frame::Frame;
use crate::message::ControlToken;
use crate::policy::Backoff;
use crate::sequence::SequenceSpace;
use crate::stats::{TransferReport, TransferStats};
use crate::store::persist_atomic;
use crate::timer::{TimeoutHandler, TimeoutScheduler};
use crate::transfer::{
    Direction, EngineCmd, Progress, Role, SilentObserver, TransferHandle, TransferId,
    TransferLink, TransferObserver,
};
use crate::{Config, Error, Result};

/// 수신 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvPhase {
    /// 개시자: `START`를 보내고 첫 응답 대기
    AwaitingInitiate,

    Receiving,

    Complete,

    Aborted,
}

impl RecvPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecvPhase::Complete | RecvPhase::Aborted)
    }
}

/// 확인을 기다리는 제어 프레임
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingControl {
    token: ControlToken,
    generation: u64,
    attempts: u32,
}

struct RecvWindow {
    phase: RecvPhase,
    paused: bool,
    space: SequenceSpace,

    /// 마지막으로 연속 수신한 번호 (-1 = 없음)
    lfr: i64,

    /// LFR 뒤에 먼저 도착한 프레임
    slots: BTreeMap<i64, Bytes>,

    assembled: Vec<u8>,

    pending: Option<PendingControl>,
    generation: u64,

    /// 연결 수립 전에 요청된 일시정지 (첫 프레임 수신 시 적용)
    deferred_pause: bool,

    stats: TransferStats,
    last_heard: Instant,

    /// 저장 실패 등 엔진을 끝낸 에러
    failure: Option<Error>,
}

struct DownloadShared {
    me: Weak<DownloadShared>,
    id: TransferId,
    config: Config,
    channel: TransportChannel,
    peer: SocketAddr,
    scheduler: TimeoutScheduler,
    total_size: u64,
    total_packets: u64,
    destination: PathBuf,
    window: Mutex<RecvWindow>,
    progress: Arc<Progress>,
    observer: RwLock<Arc<dyn TransferObserver>>,
}

/// 제어 프레임 재전송 타이머
struct ControlRetransmit {
    engine: Weak<DownloadShared>,
    generation: u64,
}

impl TimeoutHandler for ControlRetransmit {
    fn on_timeout(&self, tag: Frame) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_control_timeout(self.generation, tag);
        }
    }
}

impl DownloadShared {
    fn handle_command(&self, cmd: EngineCmd) {
        let mut window = self.window.lock();
        if window.phase.is_terminal() {
            return;
        }
        let progressed = match cmd {
            EngineCmd::Pause if window.phase == RecvPhase::AwaitingInitiate => {
                window.deferred_pause = true;
                None
            }
            EngineCmd::Resume if window.phase == RecvPhase::AwaitingInitiate => {
                window.deferred_pause = false;
                None
            }
            EngineCmd::Pause => {
                if !window.paused {
                    window.paused = true;
                    window.stats.pause_clock();
                    self.send_control(&mut window, ControlToken::Pause);
                    info!("Download {} paused", self.id);
                }
                None
            }
            EngineCmd::Resume if window.paused => {
                window.paused = false;
                window.last_heard = Instant::now();
                self.send_control(&mut window, ControlToken::Resume);
                if window.phase == RecvPhase::Receiving {
                    window.stats.resume_clock();
                }
                info!("Download {} resumed", self.id);
                self.deliver(&mut window)
            }
            EngineCmd::Resume => None,
            EngineCmd::Stop => {
                info!("Download {} stopped by request", self.id);
                self.abort(&mut window);
                None
            }
        };
        drop(window);
        self.notify_progress(progressed);
    }

    fn handle_frame(&self, frame: Frame) {
        let progressed = self.accept_frame(frame);
        self.notify_progress(progressed);
    }

    /// 관찰자 호출 (엔진 락 밖)
    fn notify_progress(&self, progressed: Option<u64>) {
        if let Some(done) = progressed {
            self.observer.read().on_progress(self.id, done, self.total_size);
        }
    }

    fn accept_frame(&self, frame: Frame) -> Option<u64> {
        let mut window = self.window.lock();
        if window.phase.is_terminal() {
            return None;
        }
        window.stats.frames_received += 1;
        window.last_heard = Instant::now();

        let token = ControlToken::from_frame(&frame);
        if let Some(pending) = window.pending {
            let acknowledged = match pending.token {
                ControlToken::Pause => token == Some(ControlToken::Ack),
                _ => true,
            };
            if acknowledged {
                debug!("Download {}: {} 확인됨", self.id, pending.token.as_str());
                window.pending = None;
            }
        }

        if window.phase == RecvPhase::AwaitingInitiate {
            window.phase = RecvPhase::Receiving;
            info!("Download {} receiving from {}", self.id, self.peer);
            if window.deferred_pause {
                window.paused = true;
                self.send_control(&mut window, ControlToken::Pause);
                info!("Download {} paused", self.id);
            } else {
                window.stats.start_clock();
            }
        }

        if frame.is_control() {
            if token != Some(ControlToken::Ack) {
                let err = Error::Protocol(format!("예상하지 못한 제어 프레임: {:?}", frame.text()));
                warn!("Download {}: {}", self.id, err);
            }
            return None;
        }

        self.on_data(&mut window, frame)
    }

    fn on_data(&self, window: &mut RecvWindow, frame: Frame) -> Option<u64> {
        let number = window
            .space
            .number_of(frame.sequence_id, window.lfr, self.config.send_window);
        let in_window = number > window.lfr
            && number <= window.lfr + self.config.receive_window as i64
            && (number as u64) < self.total_packets;

        // 일시정지 중: 버퍼링만 하고 조립/ACK하지 않음
        if window.paused {
            if in_window {
                window.slots.entry(number).or_insert(frame.payload);
            }
            return None;
        }

        if number < 0 {
            window.stats.dropped += 1;
            return None;
        }
        if number <= window.lfr {
            window.stats.duplicates += 1;
            self.send_ack(window.space.wire_id(number));
            return None;
        }
        if !in_window {
            window.stats.dropped += 1;
            debug!(
                "Download {}: 윈도우 밖 프레임 드롭 (number={}, lfr={})",
                self.id, number, window.lfr
            );
            // 아직 아무것도 받지 못했으면 ACK할 번호가 없음
            if window.lfr >= 0 {
                self.send_ack(window.space.wire_id(window.lfr));
            }
            return None;
        }

        if window.slots.contains_key(&number) {
            window.stats.duplicates += 1;
        } else {
            window.slots.insert(number, frame.payload);
        }
        self.deliver(window)
    }

    /// 연속 구간 조립 → 완료 확인 → ACK
    ///
    /// LFR이 전진하면 새 진행 바이트 수를 돌려준다.
    fn deliver(&self, window: &mut RecvWindow) -> Option<u64> {
        let before = window.lfr;
        while let Some(chunk) = window.slots.remove(&(window.lfr + 1)) {
            window.assembled.extend_from_slice(&chunk);
            window.lfr += 1;
        }

        let progressed = (window.lfr != before).then(|| {
            let done = (window.assembled.len() as u64).min(self.total_size);
            window.stats.bytes_done = done;
            self.progress.set_done(done);
            done
        });

        if window.assembled.len() as u64 >= self.total_size {
            self.complete(window);
        }

        // 최종 ACK는 저장이 끝난 뒤에 나간다
        if window.lfr >= 0 && window.phase != RecvPhase::Aborted {
            self.send_ack(window.space.wire_id(window.lfr));
        }
        progressed
    }

    fn send_ack(&self, wire: u32) {
        if let Err(e) = self.channel.send(&ControlToken::Ack.frame(wire), self.peer) {
            debug!("Download {}: ACK 전송 실패: {}", self.id, e);
        }
    }

    /// 필수 확인 제어 프레임 전송 및 재전송 타이머 등록
    fn send_control(&self, window: &mut RecvWindow, token: ControlToken) {
        let sequence_id = match token {
            ControlToken::Start => window.space.start_id(),
            _ => window.space.wire_id(window.lfr),
        };
        let frame = token.frame(sequence_id);
        if let Err(e) = self.channel.send(&frame, self.peer) {
            warn!("Download {}: {} 전송 실패: {}", self.id, token.as_str(), e);
        }

        window.generation += 1;
        window.pending = Some(PendingControl {
            token,
            generation: window.generation,
            attempts: 0,
        });
        self.arm_control(window.generation, frame);
    }

    fn arm_control(&self, generation: u64, frame: Frame) {
        let handler = Arc::new(ControlRetransmit {
            engine: self.me.clone(),
            generation,
        });
        self.scheduler
            .schedule(self.config.retransmit_timeout(), handler, frame);
    }

    fn on_control_timeout(&self, generation: u64, frame: Frame) {
        let mut window = self.window.lock();
        if window.phase.is_terminal() {
            return;
        }
        let Some(pending) = window.pending.as_mut() else {
            return;
        };
        if pending.generation != generation {
            return;
        }

        pending.attempts += 1;
        let (token, attempts) = (pending.token, pending.attempts);
        if attempts >= self.config.request_retry.attempts {
            warn!(
                "Download {} aborted: {} unacknowledged after {} attempts",
                self.id,
                token.as_str(),
                attempts
            );
            self.abort(&mut window);
            return;
        }

        if let Err(e) = self.channel.send(&frame, self.peer) {
            debug!("Download {}: {} 재전송 실패: {}", self.id, token.as_str(), e);
        }
        window.stats.resent += 1;
        debug!("Download {}: {} 재전송 ({})", self.id, token.as_str(), attempts);
        self.arm_control(generation, frame);
    }

    fn complete(&self, window: &mut RecvWindow) {
        window.assembled.truncate(self.total_size as usize);
        window.stats.pause_clock();
        window.pending = None;

        if let Err(e) = persist_atomic(&self.destination, &window.assembled) {
            warn!(
                "Download {}: 저장 실패 {}: {}",
                self.id,
                self.destination.display(),
                e
            );
            window.failure = Some(e);
            self.abort(window);
            return;
        }

        window.phase = RecvPhase::Complete;
        window.stats.bytes_done = self.total_size;
        self.progress.set_done(self.total_size);
        debug!(
            "Download {}: {} 저장 (wraps={})",
            self.id,
            self.destination.display(),
            window.space.wrap_count()
        );
    }

    fn abort(&self, window: &mut RecvWindow) {
        window.phase = RecvPhase::Aborted;
        window.pending = None;
        window.stats.pause_clock();
        self.channel.close();
    }

    fn phase(&self) -> RecvPhase {
        self.window.lock().phase
    }

    /// 다음 수신 폴링 타임아웃
    fn poll_timeout(&self) -> std::time::Duration {
        if self.window.lock().paused {
            self.config.pause_poll()
        } else {
            self.config.recv_poll()
        }
    }

    fn idle_expired(&self) -> bool {
        let window = self.window.lock();
        !window.paused && window.last_heard.elapsed() > self.config.idle_timeout()
    }

    /// 완료 후 잠시 남아 중복 프레임에 최종 LFR을 재ACK
    fn linger(&self) {
        let final_ack = {
            let window = self.window.lock();
            if self.total_packets == 0 {
                return;
            }
            window.space.wire_id(window.lfr)
        };

        let deadline = Instant::now() + self.config.linger();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.channel.receive(remaining.min(self.config.recv_poll())) {
                Ok((frame, from)) if from == self.peer => {
                    if !frame.is_control() {
                        self.window.lock().stats.duplicates += 1;
                        self.send_ack(final_ack);
                    }
                }
                Ok(_) | Err(Error::Timeout) | Err(Error::Frame(_)) => {}
                Err(_) => break,
            }
        }
    }

    fn finish(&self) -> Result<TransferReport> {
        let (report, failure) = {
            let mut window = self.window.lock();
            if !window.phase.is_terminal() {
                window.phase = RecvPhase::Aborted;
            }
            window.stats.pause_clock();
            (
                window.stats.report(window.phase == RecvPhase::Complete),
                window.failure.take(),
            )
        };
        self.channel.close();
        self.progress.finish();

        if report.completed {
            info!("Download {} complete\n{}", self.id, report);
        } else {
            warn!("Download {} INCOMPLETE\n{}", self.id, report);
        }
        self.observer.read().on_finished(&report);

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// 다운로드 엔진
pub struct DownloadEngine {
    shared: Arc<DownloadShared>,
    role: Role,
    commands: Receiver<EngineCmd>,
    command_tx: Sender<EngineCmd>,
}

impl DownloadEngine {
    /// 새 다운로드 엔진 생성
    ///
    /// `total_size` 바이트를 받아 `destination`에 저장한다.
    /// 개시자는 `link.start_id`를 담은 `START`를 먼저 보낸다.
    pub fn new(
        config: Config,
        scheduler: TimeoutScheduler,
        link: TransferLink,
        total_size: u64,
        destination: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        if link.start_id >= config.max_id {
            return Err(Error::Protocol(format!(
                "start_id({}) >= max_id({})",
                link.start_id, config.max_id
            )));
        }

        let total_packets = config.packets_for(total_size);
        let window = RecvWindow {
            phase: match link.role {
                Role::Initiator => RecvPhase::AwaitingInitiate,
                Role::Responder => RecvPhase::Receiving,
            },
            paused: false,
            space: SequenceSpace::new(link.start_id, config.max_id),
            lfr: -1,
            slots: BTreeMap::new(),
            assembled: Vec::with_capacity(total_size.min(64 * 1024 * 1024) as usize),
            pending: None,
            generation: 0,
            deferred_pause: false,
            stats: TransferStats::new(link.id, Direction::Download, total_size, total_packets),
            last_heard: Instant::now(),
            failure: None,
        };

        let (command_tx, commands) = crossbeam_channel::unbounded();
        let shared = Arc::new_cyclic(|me| DownloadShared {
            me: me.clone(),
            id: link.id,
            config,
            channel: link.channel,
            peer: link.peer,
            scheduler,
            total_size,
            total_packets,
            destination: destination.into(),
            window: Mutex::new(window),
            progress: Arc::new(Progress::new(total_size)),
            observer: RwLock::new(Arc::new(SilentObserver)),
        });

        Ok(Self {
            shared,
            role: link.role,
            commands,
            command_tx,
        })
    }

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

    pub fn start_id(&self) -> u32 {
        self.shared.window.lock().space.start_id()
    }

    /// 전용 스레드에서 실행
    pub fn spawn(self) -> Result<TransferHandle> {
        let id = self.shared.id;
        let progress = self.shared.progress.clone();
        let commands = self.command_tx.clone();
        let worker = std::thread::Builder::new()
            .name(format!("swft-download-{id}"))
            .spawn(move || self.run())?;
        Ok(TransferHandle::new(
            id,
            Direction::Download,
            commands,
            progress,
            worker,
        ))
    }

    /// 현재 스레드에서 전송이 끝날 때까지 실행
    pub fn run(self) -> Result<TransferReport> {
        let shared = self.shared;
        info!(
            "Download {} started: {} bytes in {} packets ← {}",
            shared.id, shared.total_size, shared.total_packets, shared.peer
        );

        {
            let mut window = shared.window.lock();
            if shared.total_packets == 0 {
                shared.complete(&mut window);
            } else if self.role == Role::Initiator {
                shared.send_control(&mut window, ControlToken::Start);
            } else {
                window.stats.start_clock();
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
                warn!("Download {}: 피어 응답 없음", shared.id);
                break;
            }

            match shared.channel.receive(shared.poll_timeout()) {
                Ok((frame, from)) => {
                    backoff.reset();
                    if from != shared.peer {
                        debug!("Download {}: 다른 주소의 프레임 드롭: {}", shared.id, from);
                        continue;
                    }
                    shared.handle_frame(frame);
                }
                Err(Error::Timeout) => {}
                Err(Error::ChannelClosed) => break,
                Err(Error::Frame(e)) => {
                    warn!("Download {}: 잘못된 데이터그램 드롭: {}", shared.id, e);
                }
                Err(e) => {
                    warn!("Download {}: 수신 에러: {}", shared.id, e);
                    match backoff.next_delay() {
                        Some(delay) => std::thread::sleep(delay),
                        None => break,
                    }
                }
            }
        }

        if shared.phase() == RecvPhase::Complete {
            shared.linger();
        }
        shared.finish()
    }
}
