//! 세션 핸드쉐이크
//!
//! 서버는 랑데부 포트에서 `INIT`을 기다리고, 요청마다 임시 포트의 세션 채널을
//! 열어 [`ClientSession`]을 전용 스레드로 실행한 뒤 `INIT;<port>`로 응답한다.
//! 응답을 잃은 클라이언트가 `INIT`을 다시 보내면 같은 포트를 다시 알려준다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::channel::TransportChannel;
use crate::frame::Frame;
use crate::message::{ControlToken, Reply};
use crate::policy::Backoff;
use crate::session::ClientSession;
use crate::store::FileStore;
use crate::timer::TimeoutScheduler;
use crate::{Config, Error, Result, RetryPolicy};

/// 랑데부 포트의 세션 수락자
pub struct SessionAcceptor {
    config: Config,
    scheduler: TimeoutScheduler,
    store: Arc<dyn FileStore>,
    channel: TransportChannel,

    /// 클라이언트 주소 → 세션 포트
    sessions: Arc<DashMap<SocketAddr, u16>>,

    running: Arc<AtomicBool>,
}

impl SessionAcceptor {
    pub fn bind(
        addr: SocketAddr,
        config: Config,
        scheduler: TimeoutScheduler,
        store: Arc<dyn FileStore>,
    ) -> Result<Self> {
        let channel = TransportChannel::bind(addr, config.codec())?;
        Self::with_channel(channel, config, scheduler, store)
    }

    /// 이미 열린 채널을 랑데부 포트로 사용
    pub fn with_channel(
        channel: TransportChannel,
        config: Config,
        scheduler: TimeoutScheduler,
        store: Arc<dyn FileStore>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Rendezvous listening on {}", channel.local_addr());
        Ok(Self {
            config,
            scheduler,
            store,
            channel,
            sessions: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// 전용 스레드에서 수락 루프 실행
    pub fn spawn(self) -> Result<AcceptorHandle> {
        let local_addr = self.local_addr();
        let sessions = self.sessions.clone();
        let running = self.running.clone();
        let worker = std::thread::Builder::new()
            .name("swft-acceptor".into())
            .spawn(move || self.serve())?;
        Ok(AcceptorHandle {
            local_addr,
            sessions,
            running,
            worker: Some(worker),
        })
    }

    /// 종료 플래그가 내려가거나 채널이 닫힐 때까지 `INIT` 처리
    pub fn serve(self) -> Result<()> {
        let mut backoff = Backoff::new(self.config.error_backoff.clone());

        while self.running.load(Ordering::SeqCst) {
            let (frame, from) = match self.channel.receive(self.config.recv_poll()) {
                Ok(received) => {
                    backoff.reset();
                    received
                }
                Err(Error::Timeout) => continue,
                Err(Error::Frame(e)) => {
                    warn!("랑데부: 잘못된 데이터그램 드롭: {}", e);
                    continue;
                }
                Err(Error::ChannelClosed) => break,
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!("랑데부 수신 에러: {} ({:?} 후 재시도)", e, delay);
                        std::thread::sleep(delay);
                        continue;
                    }
                    None => return Err(e),
                },
            };

            if ControlToken::from_frame(&frame) != Some(ControlToken::Init) {
                debug!("랑데부: INIT이 아닌 프레임 드롭 ({})", from);
                continue;
            }

            match self.accept(from) {
                Ok(port) => {
                    let reply = Reply::Init { port }.to_frame(frame.sequence_id);
                    // 클라이언트가 INIT을 다시 보내면 같은 포트로 재응답
                    if let Err(e) = self.channel.send(&reply, from) {
                        warn!("INIT 응답 전송 실패 ({}): {}", from, e);
                    }
                }
                Err(e) => warn!("세션 생성 실패 ({}): {}", from, e),
            }
        }

        self.channel.close();
        info!("Rendezvous {} stopped", self.local_addr());
        Ok(())
    }

    /// 세션 포트 할당 (이미 살아있는 세션이면 같은 포트)
    fn accept(&self, client: SocketAddr) -> Result<u16> {
        if let Some(port) = self.sessions.get(&client) {
            debug!("중복 INIT ({}): 기존 세션 포트 {}", client, *port);
            return Ok(*port);
        }

        let bind = SocketAddr::new(self.local_addr().ip(), 0);
        let channel = TransportChannel::bind(bind, self.config.codec())?;
        let port = channel.local_addr().port();

        self.sessions.insert(client, port);
        let spawned = ClientSession::new(
            self.config.clone(),
            self.scheduler.clone(),
            self.store.clone(),
            channel,
            client,
        )
        .attach(self.running.clone(), self.sessions.clone())
        .spawn();

        if let Err(e) = spawned {
            self.sessions.remove(&client);
            return Err(e);
        }
        info!("Session for {} on port {}", client, port);
        Ok(port)
    }
}

/// 실행 중인 수락자 핸들
pub struct AcceptorHandle {
    local_addr: SocketAddr,
    sessions: Arc<DashMap<SocketAddr, u16>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl AcceptorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 살아있는 세션 수
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 수락자와 모든 세션 종료 (진행 중인 전송 엔진은 각자 끝난다)
    pub fn shutdown(mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| Error::Session("수락자 스레드 패닉".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for AcceptorHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// 클라이언트측 핸드쉐이크: 세션 주소 반환
///
/// `INIT`을 보내고 `INIT;<port>` 응답을 기다린다. 시도마다 `retry.delay(n)`만큼 기다리며
/// 다른 응답이 오거나 시도를 모두 쓰면 [`Error::Session`].
pub fn handshake(channel: &TransportChannel, server: SocketAddr, retry: &RetryPolicy) -> Result<SocketAddr> {
    for attempt in 0..retry.attempts.max(1) {
        let request = ControlToken::Init.frame(attempt);
        channel.send(&request, server)?;
        debug!("INIT → {} (attempt {})", server, attempt + 1);

        let deadline = Instant::now() + retry.delay(attempt);
        if let Some(frame) = await_reply(channel, server, attempt, deadline)? {
            return match Reply::from_frame(&frame) {
                Ok(Reply::Init { port }) => {
                    let session = SocketAddr::new(server.ip(), port);
                    info!("Handshake complete: session {}", session);
                    Ok(session)
                }
                Ok(other) => Err(Error::Session(format!("예상치 못한 핸드쉐이크 응답: {other:?}"))),
                Err(e) => Err(Error::Session(format!("핸드쉐이크 응답 해석 실패: {e}"))),
            };
        }
    }

    Err(Error::Session(format!(
        "핸드쉐이크 실패: {} 응답 없음 ({}회 시도)",
        server, retry.attempts
    )))
}

/// `deadline`까지 `from`에서 온 `sequence_id` 응답 대기
pub(crate) fn await_reply(
    channel: &TransportChannel,
    from: SocketAddr,
    sequence_id: u32,
    deadline: Instant,
) -> Result<Option<Frame>> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        // 0은 무한 대기라서 남은 시간이 없으면 여기서 끝낸다
        if remaining < Duration::from_millis(1) {
            return Ok(None);
        }
        match channel.receive(remaining) {
            Ok((frame, addr)) if addr == from && frame.sequence_id == sequence_id => {
                return Ok(Some(frame))
            }
            Ok((frame, addr)) => {
                debug!("응답 대기 중 무시: seq={} from {}", frame.sequence_id, addr);
            }
            Err(Error::Timeout) => return Ok(None),
            Err(Error::Frame(e)) => warn!("잘못된 응답 드롭: {}", e),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RefusingSocket;
    use crate::store::DirStore;
    use crate::FrameCodec;

    fn acceptor() -> (AcceptorHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DirStore::open(dir.path()).unwrap());
        let mut config = Config::lan();
        config.recv_poll_ms = 50;
        let handle = SessionAcceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            config,
            TimeoutScheduler::default(),
            store,
        )
        .unwrap()
        .spawn()
        .unwrap();
        (handle, dir)
    }

    #[test]
    fn test_handshake_allocates_session() {
        let (server, _dir) = acceptor();
        let client = TransportChannel::bind("127.0.0.1:0", FrameCodec::default()).unwrap();

        let session = handshake(&client, server.local_addr(), &RetryPolicy::fixed(3, 500)).unwrap();
        assert_ne!(session.port(), server.local_addr().port());
        assert_eq!(server.session_count(), 1);

        server.shutdown().unwrap();
    }

    #[test]
    fn test_duplicate_init_gets_same_port() {
        let (server, _dir) = acceptor();
        let client = TransportChannel::bind("127.0.0.1:0", FrameCodec::default()).unwrap();
        let retry = RetryPolicy::fixed(3, 500);

        let first = handshake(&client, server.local_addr(), &retry).unwrap();
        let second = handshake(&client, server.local_addr(), &retry).unwrap();
        assert_eq!(first, second);
        assert_eq!(server.session_count(), 1);

        server.shutdown().unwrap();
    }

    #[test]
    fn test_failed_init_reply_keeps_rendezvous_serving() {
        let dir = tempfile::tempdir().unwrap();
        let first = TransportChannel::bind("127.0.0.1:0", FrameCodec::default()).unwrap();
        let second = TransportChannel::bind("127.0.0.1:0", FrameCodec::default()).unwrap();

        let socket = RefusingSocket::bind(first.local_addr());
        let channel = TransportChannel::from_datagram(socket.clone(), FrameCodec::default()).unwrap();
        let mut config = Config::lan();
        config.recv_poll_ms = 50;
        let server = SessionAcceptor::with_channel(
            channel,
            config,
            TimeoutScheduler::default(),
            Arc::new(DirStore::open(dir.path()).unwrap()),
        )
        .unwrap()
        .spawn()
        .unwrap();

        // 첫 클라이언트로의 응답은 실패
        let result = handshake(&first, server.local_addr(), &RetryPolicy::fixed(1, 200));
        assert!(matches!(result, Err(Error::Session(_))));

        // 다른 클라이언트는 계속 접속 가능
        let retry = RetryPolicy::fixed(3, 500);
        handshake(&second, server.local_addr(), &retry).unwrap();

        // 재시도한 INIT은 이미 할당된 세션 포트를 받는다
        socket.allow();
        handshake(&first, server.local_addr(), &retry).unwrap();
        assert_eq!(server.session_count(), 2);

        server.shutdown().unwrap();
    }

    #[test]
    fn test_handshake_without_server_fails() {
        // 바인딩만 하고 응답하지 않는 소켓
        let silent = TransportChannel::bind("127.0.0.1:0", FrameCodec::default()).unwrap();
        let client = TransportChannel::bind("127.0.0.1:0", FrameCodec::default()).unwrap();

        let result = handshake(&client, silent.local_addr(), &RetryPolicy::fixed(2, 50));
        assert!(matches!(result, Err(Error::Session(_))));
    }
}
