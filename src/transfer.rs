//! 전송 공통 타입
//!
//! 엔진 스레드를 외부에서 제어하는 [`TransferHandle`], 진행 콜백
//! [`TransferObserver`], 엔진 생성에 필요한 [`TransferLink`]를 정의한다.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use rand::Rng;

use crate::channel::TransportChannel;
use crate::stats::TransferReport;
use crate::{Error, Result};

/// 전송 식별자 (서버측 전송 포트)
pub type TransferId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// 전송에서 맡은 역할
///
/// 개시자(클라이언트)가 항상 첫 패킷을 보낸다: 다운로드는 `START`, 업로드는 첫 데이터.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// 엔진 제어 명령
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineCmd {
    Pause,
    Resume,
    Stop,
}

/// 엔진 생성 정보: 전송 채널과 바인딩된 피어
pub struct TransferLink {
    pub id: TransferId,
    pub role: Role,
    pub channel: TransportChannel,
    pub peer: SocketAddr,
    /// 첫 패킷의 wire id (송신 응답자는 `START`에서 받은 값으로 대체)
    pub start_id: u32,
}

impl TransferLink {
    pub fn new(id: TransferId, role: Role, channel: TransportChannel, peer: SocketAddr) -> Self {
        Self {
            id,
            role,
            channel,
            peer,
            start_id: 0,
        }
    }

    pub fn with_start_id(mut self, start_id: u32) -> Self {
        self.start_id = start_id;
        self
    }
}

/// 수신측이 고르는 임의의 시작 id
pub fn random_start_id(max_id: u32) -> u32 {
    rand::thread_rng().gen_range(0..max_id.max(1))
}

/// 진행 상황 콜백
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, _id: TransferId, _bytes_done: u64, _total_bytes: u64) {}

    fn on_finished(&self, _report: &TransferReport) {}
}

/// 아무것도 하지 않는 관찰자
pub struct SilentObserver;

impl TransferObserver for SilentObserver {}

/// 엔진과 핸들이 공유하는 진행 카운터
#[derive(Debug, Default)]
pub(crate) struct Progress {
    done: AtomicU64,
    total: AtomicU64,
    finished: AtomicBool,
}

impl Progress {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            ..Self::default()
        }
    }

    pub(crate) fn set_done(&self, done: u64) {
        self.done.store(done, Ordering::Relaxed);
    }

    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// 실행 중인 전송 엔진 핸들
pub struct TransferHandle {
    id: TransferId,
    direction: Direction,
    commands: Sender<EngineCmd>,
    progress: Arc<Progress>,
    worker: Option<JoinHandle<Result<TransferReport>>>,
}

impl TransferHandle {
    pub(crate) fn new(
        id: TransferId,
        direction: Direction,
        commands: Sender<EngineCmd>,
        progress: Arc<Progress>,
        worker: JoinHandle<Result<TransferReport>>,
    ) -> Self {
        Self {
            id,
            direction,
            commands,
            progress,
            worker: Some(worker),
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn pause(&self) -> Result<()> {
        self.command(EngineCmd::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.command(EngineCmd::Resume)
    }

    /// 전송 중단 (엔진은 미완료로 끝난다)
    pub fn stop(&self) -> Result<()> {
        self.command(EngineCmd::Stop)
    }

    pub fn bytes_done(&self) -> u64 {
        self.progress.done.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.progress.total.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.progress.finished.load(Ordering::SeqCst)
    }

    /// 엔진 스레드 종료를 기다려 최종 보고서 반환
    pub fn join(mut self) -> Result<TransferReport> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| Error::Transport(format!("전송 {} 엔진 스레드 패닉", self.id)))?,
            None => Err(Error::UnknownTransfer(self.id)),
        }
    }

    fn command(&self, cmd: EngineCmd) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| Error::UnknownTransfer(self.id))
    }
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("bytes_done", &self.bytes_done())
            .field("finished", &self.is_finished())
            .finish()
    }
}
