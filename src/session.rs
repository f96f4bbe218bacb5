//! 서버측 클라이언트 세션
//!
//! 핸드쉐이크에서 할당된 전용 채널로 클라이언트 하나의 명령을 처리한다.
//! 응답은 요청의 sequence id를 그대로 쓰며, 직전 요청이 다시 오면
//! 캐시된 응답을 재전송한다 (응답 손실 대비).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::channel::TransportChannel;
use crate::frame::Frame;
use crate::message::{Command, Reply};
use crate::policy::Backoff;
use crate::receiver::DownloadEngine;
use crate::sender::UploadEngine;
use crate::store::FileStore;
use crate::timer::TimeoutScheduler;
use crate::transfer::{random_start_id, Role, TransferHandle, TransferId, TransferLink};
use crate::{Config, Error, Result};

/// 클라이언트 세션 하나
pub struct ClientSession {
    config: Config,
    scheduler: TimeoutScheduler,
    store: Arc<dyn FileStore>,
    channel: TransportChannel,
    peer: SocketAddr,

    /// 이 세션이 시작한 전송 (transfer id = 서버측 전송 포트)
    transfers: HashMap<TransferId, TransferHandle>,

    /// 직전 요청의 sequence id와 응답
    last_reply: Option<(u32, Frame)>,

    running: Arc<AtomicBool>,

    /// 종료 시 자신을 지울 세션 목록
    registry: Option<Arc<DashMap<SocketAddr, u16>>>,
}

impl ClientSession {
    pub fn new(
        config: Config,
        scheduler: TimeoutScheduler,
        store: Arc<dyn FileStore>,
        channel: TransportChannel,
        peer: SocketAddr,
    ) -> Self {
        Self {
            config,
            scheduler,
            store,
            channel,
            peer,
            transfers: HashMap::new(),
            last_reply: None,
            running: Arc::new(AtomicBool::new(true)),
            registry: None,
        }
    }

    /// 수락자 종료 플래그와 세션 목록 연결
    pub(crate) fn attach(
        mut self,
        running: Arc<AtomicBool>,
        registry: Arc<DashMap<SocketAddr, u16>>,
    ) -> Self {
        self.running = running;
        self.registry = Some(registry);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let name = format!("swft-session-{}", self.local_addr().port());
        let worker = std::thread::Builder::new().name(name).spawn(move || {
            if let Err(e) = self.run() {
                warn!("세션 종료 에러: {}", e);
            }
        })?;
        Ok(worker)
    }

    /// `exit` 명령, 수락자 종료, 또는 유휴 시간 초과까지 명령 처리
    pub fn run(mut self) -> Result<()> {
        info!("Session {} ↔ {} opened", self.local_addr(), self.peer);
        let mut last_activity = Instant::now();
        let mut backoff = Backoff::new(self.config.error_backoff.clone());

        let result = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }

            self.transfers.retain(|_, handle| !handle.is_finished());
            if self.transfers.is_empty() && last_activity.elapsed() > self.config.session_timeout() {
                info!("Session {} idle, closing", self.local_addr());
                break Ok(());
            }

            let (frame, from) = match self.channel.receive(self.config.recv_poll()) {
                Ok(received) => {
                    backoff.reset();
                    received
                }
                Err(Error::Timeout) => continue,
                Err(Error::Frame(e)) => {
                    warn!("Session {}: 잘못된 데이터그램 드롭: {}", self.local_addr(), e);
                    continue;
                }
                Err(Error::ChannelClosed) => break Ok(()),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!("Session {}: 수신 에러: {} ({:?} 후 재시도)", self.local_addr(), e, delay);
                        std::thread::sleep(delay);
                        continue;
                    }
                    None => break Err(e),
                },
            };
            if from != self.peer {
                debug!("Session {}: 다른 주소의 프레임 드롭: {}", self.local_addr(), from);
                continue;
            }
            last_activity = Instant::now();

            // 응답 손실로 인한 재요청
            if let Some((sequence_id, reply)) = &self.last_reply {
                if *sequence_id == frame.sequence_id {
                    debug!("Session {}: 캐시된 응답 재전송 (seq={})", self.local_addr(), sequence_id);
                    self.send_reply(reply);
                    continue;
                }
            }

            let (reply, exit) = match Command::from_frame(&frame) {
                Ok(command) => {
                    let exit = command == Command::Exit;
                    (self.execute(command), exit)
                }
                Err(e) => (Reply::Error(e.to_string()), false),
            };

            // 전송 실패해도 캐시: 클라이언트 재요청에 재전송
            let reply = reply.to_frame(frame.sequence_id);
            self.send_reply(&reply);
            self.last_reply = Some((frame.sequence_id, reply));

            if exit {
                break Ok(());
            }
        };

        self.close();
        result
    }

    /// 명령 하나 처리. 실패는 `error;<message>` 응답이 된다
    pub fn execute(&mut self, command: Command) -> Reply {
        debug!("Session {}: {:?}", self.local_addr(), command);
        let outcome = match command {
            Command::List => self.store.list().map(Reply::Listing),
            Command::Download { name, port } => self.start_download(&name, port),
            Command::Upload { name, size, port } => self.start_upload(&name, size, port),
            Command::Delete { name } => self.store.delete(&name).map(|_| Reply::Ok),
            Command::Pause { transfer } => self.transfer(transfer).and_then(|h| h.pause()).map(|_| Reply::Ok),
            Command::Resume { transfer } => self.transfer(transfer).and_then(|h| h.resume()).map(|_| Reply::Ok),
            Command::Exit => Ok(Reply::Ok),
        };

        outcome.unwrap_or_else(|e| {
            warn!("Session {}: 명령 실패: {}", self.local_addr(), e);
            Reply::Error(e.to_string())
        })
    }

    /// 서버 → 클라이언트: 서버가 송신 응답자
    fn start_download(&mut self, name: &str, client_port: u16) -> Result<Reply> {
        let data = self.store.read(name)?;
        let size = data.len() as u64;
        let (link, port) = self.link(client_port, Role::Responder)?;

        let handle = UploadEngine::new(self.config.clone(), self.scheduler.clone(), link, data)?
            .spawn()?;
        info!("Session {}: download {} ({} bytes) as transfer {}", self.local_addr(), name, size, port);
        self.transfers.insert(handle.id(), handle);
        Ok(Reply::Download { port, size })
    }

    /// 클라이언트 → 서버: 서버가 수신 응답자, 시작 id를 고른다
    fn start_upload(&mut self, name: &str, size: u64, client_port: u16) -> Result<Reply> {
        let destination = self.store.destination(name)?;
        let start_id = random_start_id(self.config.max_id);
        let (link, port) = self.link(client_port, Role::Responder)?;
        let link = link.with_start_id(start_id);

        let handle = DownloadEngine::new(
            self.config.clone(),
            self.scheduler.clone(),
            link,
            size,
            destination,
        )?
        .spawn()?;
        info!("Session {}: upload {} ({} bytes) as transfer {}", self.local_addr(), name, size, port);
        self.transfers.insert(handle.id(), handle);
        Ok(Reply::Upload { port, start_id })
    }

    /// 새 전송 채널을 열고 클라이언트 전송 포트와 연결
    fn link(&self, client_port: u16, role: Role) -> Result<(TransferLink, u16)> {
        let bind = SocketAddr::new(self.channel.local_addr().ip(), 0);
        let channel = TransportChannel::bind(bind, self.config.codec())?;
        let port = channel.local_addr().port();
        let peer = SocketAddr::new(self.peer.ip(), client_port);
        Ok((TransferLink::new(port as TransferId, role, channel, peer), port))
    }

    fn send_reply(&self, reply: &Frame) {
        if let Err(e) = self.channel.send(reply, self.peer) {
            warn!("Session {}: 응답 전송 실패 (seq={}): {}", self.local_addr(), reply.sequence_id, e);
        }
    }

    fn transfer(&self, id: TransferId) -> Result<&TransferHandle> {
        self.transfers.get(&id).ok_or(Error::UnknownTransfer(id))
    }

    fn close(&mut self) {
        self.channel.close();
        if let Some(registry) = &self.registry {
            registry.remove(&self.peer);
        }
        info!("Session {} ↔ {} closed", self.local_addr(), self.peer);
    }
}
