//! 클라이언트 컨트롤러
//!
//! 핸드쉐이크로 얻은 세션에 명령을 보내고, 전송마다 새 채널과 엔진을 만든다.
//! 다운로드는 로컬 수신 엔진이, 업로드는 로컬 송신 엔진이 개시자가 된다.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::channel::TransportChannel;
use crate::handshake::{await_reply, handshake};
use crate::message::{Command, Reply};
use crate::receiver::DownloadEngine;
use crate::sender::UploadEngine;
use crate::stats::TransferReport;
use crate::timer::TimeoutScheduler;
use crate::transfer::{
    random_start_id, Direction, Role, SilentObserver, TransferHandle, TransferId, TransferLink,
    TransferObserver,
};
use crate::{Config, Error, Result};

/// 서버 세션 하나에 연결된 클라이언트
pub struct ClientController {
    config: Config,
    scheduler: TimeoutScheduler,
    channel: TransportChannel,
    session: SocketAddr,
    next_sequence: u32,
    transfers: HashMap<TransferId, TransferHandle>,
    observer: Arc<dyn TransferObserver>,
}

impl ClientController {
    /// 랑데부 주소로 핸드쉐이크 후 세션 연결
    pub fn connect(server: SocketAddr, config: Config, scheduler: TimeoutScheduler) -> Result<Self> {
        config.validate()?;
        let channel = TransportChannel::bind(local_bind_addr(server), config.codec())?;
        let session = handshake(&channel, server, &config.request_retry)?;

        Ok(Self {
            config,
            scheduler,
            channel,
            session,
            next_sequence: 1,
            transfers: HashMap::new(),
            observer: Arc::new(SilentObserver),
        })
    }

    /// 이후 시작하는 전송에 진행 콜백 등록
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn session_addr(&self) -> SocketAddr {
        self.session
    }

    pub fn list(&mut self) -> Result<Vec<String>> {
        match self.request(Command::List)? {
            Reply::Listing(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    /// 원격 파일을 `destination`으로 내려받는 전송 시작
    pub fn download(&mut self, name: &str, destination: impl Into<PathBuf>) -> Result<TransferId> {
        let channel = self.transfer_channel()?;
        let start_id = random_start_id(self.config.max_id);
        let command = Command::Download {
            name: name.to_string(),
            port: channel.local_addr().port(),
        };

        let (port, size) = match self.request(command)? {
            Reply::Download { port, size } => (port, size),
            other => return Err(unexpected(other)),
        };

        let link = self.link(port, channel).with_start_id(start_id);
        let handle = DownloadEngine::new(
            self.config.clone(),
            self.scheduler.clone(),
            link,
            size,
            destination,
        )?
        .with_observer(self.observer.clone())
        .spawn()?;

        info!("Download {} ({} bytes) as transfer {}", name, size, port);
        Ok(self.track(handle))
    }

    /// 로컬 파일을 `name`으로 올리는 전송 시작
    pub fn upload(&mut self, path: &Path, name: &str) -> Result<TransferId> {
        let data = Bytes::from(std::fs::read(path)?);
        self.upload_bytes(name, data)
    }

    pub fn upload_bytes(&mut self, name: &str, data: Bytes) -> Result<TransferId> {
        let channel = self.transfer_channel()?;
        let command = Command::Upload {
            name: name.to_string(),
            size: data.len() as u64,
            port: channel.local_addr().port(),
        };

        let (port, start_id) = match self.request(command)? {
            Reply::Upload { port, start_id } => (port, start_id),
            other => return Err(unexpected(other)),
        };

        let size = data.len();
        let link = self.link(port, channel).with_start_id(start_id);
        let handle = UploadEngine::new(self.config.clone(), self.scheduler.clone(), link, data)?
            .with_observer(self.observer.clone())
            .spawn()?;

        info!("Upload {} ({} bytes) as transfer {}", name, size, port);
        Ok(self.track(handle))
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        match self.request(Command::Delete { name: name.to_string() })? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// 다운로드는 로컬 수신 엔진에서, 업로드는 서버 세션을 통해 일시정지
    pub fn pause(&mut self, id: TransferId) -> Result<()> {
        match self.direction_of(id)? {
            Direction::Download => self.handle(id)?.pause(),
            Direction::Upload => self.expect_ok(Command::Pause { transfer: id }),
        }
    }

    pub fn resume(&mut self, id: TransferId) -> Result<()> {
        match self.direction_of(id)? {
            Direction::Download => self.handle(id)?.resume(),
            Direction::Upload => self.expect_ok(Command::Resume { transfer: id }),
        }
    }

    /// 전송이 끝날 때까지 기다려 최종 보고서 반환
    pub fn wait(&mut self, id: TransferId) -> Result<TransferReport> {
        let handle = self.transfers.remove(&id).ok_or(Error::UnknownTransfer(id))?;
        let report = handle.join()?;
        info!("{}", report.summary());
        Ok(report)
    }

    /// 진행 중인 전송 목록: (id, 방향, 완료 바이트, 전체 바이트)
    pub fn transfers(&self) -> Vec<(TransferId, Direction, u64, u64)> {
        let mut list: Vec<_> = self
            .transfers
            .values()
            .map(|h| (h.id(), h.direction(), h.bytes_done(), h.total_bytes()))
            .collect();
        list.sort_by_key(|entry| entry.0);
        list
    }

    /// 세션 종료. 남은 전송은 끝날 때까지 기다린다
    pub fn close(mut self) -> Result<()> {
        let ids: Vec<TransferId> = self.transfers.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.wait(id) {
                warn!("전송 {} 종료 에러: {}", id, e);
            }
        }

        let result = self.expect_ok(Command::Exit);
        self.channel.close();
        info!("Session {} closed", self.session);
        result
    }

    /// 요청 전송 후 같은 sequence id의 응답 대기 (재시도 포함)
    ///
    /// `error;<message>` 응답은 [`Error::Session`]이 된다.
    pub fn request(&mut self, command: Command) -> Result<Reply> {
        let sequence_id = self.next_sequence;
        self.next_sequence = (self.next_sequence + 1) % self.config.max_id;
        let frame = command.to_frame(sequence_id);
        let retry = self.config.request_retry.clone();

        for attempt in 0..retry.attempts.max(1) {
            self.channel.send(&frame, self.session)?;
            debug!("{:?} → {} (seq={}, attempt {})", command, self.session, sequence_id, attempt + 1);

            let deadline = Instant::now() + retry.delay(attempt);
            if let Some(reply) = await_reply(&self.channel, self.session, sequence_id, deadline)? {
                return match Reply::from_frame(&reply)? {
                    Reply::Error(message) => Err(Error::Session(message)),
                    reply => Ok(reply),
                };
            }
        }

        Err(Error::Session(format!(
            "세션 {} 응답 없음: {}",
            self.session,
            command.encode()
        )))
    }

    fn expect_ok(&mut self, command: Command) -> Result<()> {
        match self.request(command)? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn transfer_channel(&self) -> Result<TransportChannel> {
        let bind = SocketAddr::new(self.channel.local_addr().ip(), 0);
        TransportChannel::bind(bind, self.config.codec())
    }

    fn link(&self, port: u16, channel: TransportChannel) -> TransferLink {
        let peer = SocketAddr::new(self.session.ip(), port);
        TransferLink::new(port as TransferId, Role::Initiator, channel, peer)
    }

    fn track(&mut self, handle: TransferHandle) -> TransferId {
        let id = handle.id();
        self.transfers.insert(id, handle);
        id
    }

    fn handle(&self, id: TransferId) -> Result<&TransferHandle> {
        self.transfers.get(&id).ok_or(Error::UnknownTransfer(id))
    }

    fn direction_of(&self, id: TransferId) -> Result<Direction> {
        self.handle(id).map(|h| h.direction())
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::Protocol(format!("예상치 못한 응답: {}", reply.encode()))
}

/// 서버 주소에 맞는 로컬 바인드 주소 (루프백 서버면 루프백)
pub fn local_bind_addr(server: SocketAddr) -> SocketAddr {
    let ip = match server.ip() {
        IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(ip) if ip.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
