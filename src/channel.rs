//! 데이터그램 채널
//!
//! 바인딩된 UDP 엔드포인트 하나를 감싸 프레임 단위 송수신을 제공한다.
//! 소켓 자체는 [`Datagram`] 트레잇 뒤에 있어 손실 시뮬레이터로 교체할 수 있다.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::frame::{Frame, FrameCodec};
use crate::{Error, FrameError, Result};

/// 데이터그램 소켓 추상화
pub trait Datagram: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// `None`이면 무한 대기
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Datagram for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// 프레임 송수신 채널
pub struct TransportChannel {
    endpoint: RwLock<Option<Arc<dyn Datagram>>>,
    codec: FrameCodec,
    local_addr: SocketAddr,

    /// 최대 패킷 크기 + 1: 초과 데이터그램은 잘려서 Oversized로 드러난다
    buffer: Mutex<Vec<u8>>,
}

impl TransportChannel {
    /// UDP 소켓을 바인딩하여 채널 생성 (포트 0이면 임시 포트)
    pub fn bind(addr: impl ToSocketAddrs, codec: FrameCodec) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Self::from_datagram(Arc::new(socket), codec)
    }

    /// 이미 만들어진 데이터그램 엔드포인트로 채널 생성
    pub fn from_datagram(endpoint: Arc<dyn Datagram>, codec: FrameCodec) -> Result<Self> {
        let local_addr = endpoint.local_addr()?;
        Ok(Self {
            endpoint: RwLock::new(Some(endpoint)),
            codec,
            local_addr,
            buffer: Mutex::new(vec![0u8; codec.max_packet_size() + 1]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// 프레임을 인코딩하여 전송
    pub fn send(&self, frame: &Frame, dest: SocketAddr) -> Result<()> {
        let endpoint = self.endpoint()?;
        let bytes = self.codec.encode(frame).map_err(|e| match e {
            FrameError::Oversized { size, max } => {
                Error::Transport(format!("프레임이 최대 패킷 크기를 넘음: {size} > {max}"))
            }
            other => Error::Frame(other),
        })?;

        endpoint.send_to(&bytes, dest)?;
        Ok(())
    }

    /// 데이터그램 하나를 수신하여 디코딩
    ///
    /// `timeout`이 0이면 무한 대기. 타임아웃은 [`Error::Timeout`],
    /// 잘못된 데이터그램은 [`Error::Frame`]으로 반환된다.
    pub fn receive(&self, timeout: Duration) -> Result<(Frame, SocketAddr)> {
        let endpoint = self.endpoint()?;
        let timeout = (!timeout.is_zero()).then_some(timeout);
        endpoint.set_read_timeout(timeout)?;

        let mut buf = self.buffer.lock();
        let (len, from) = match endpoint.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(Error::Timeout);
            }
            Err(e) => {
                if self.is_closed() {
                    return Err(Error::ChannelClosed);
                }
                return Err(Error::Io(e));
            }
        };

        let frame = self.codec.decode(&buf[..len])?;
        Ok((frame, from))
    }

    /// 엔드포인트 해제. 두 번째 호출은 아무것도 하지 않는다
    pub fn close(&self) {
        if self.endpoint.write().take().is_some() {
            debug!("채널 닫힘: {}", self.local_addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.read().is_none()
    }

    /// I/O는 락 밖에서 복제된 핸들로 수행
    fn endpoint(&self) -> Result<Arc<dyn Datagram>> {
        self.endpoint.read().clone().ok_or(Error::ChannelClosed)
    }
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 지정한 주소로의 송신을 거부하는 소켓
#[cfg(test)]
pub(crate) struct RefusingSocket {
    socket: UdpSocket,
    refused: RwLock<Option<SocketAddr>>,
}

#[cfg(test)]
impl RefusingSocket {
    pub(crate) fn bind(refused: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            socket: UdpSocket::bind("127.0.0.1:0").unwrap(),
            refused: RwLock::new(Some(refused)),
        })
    }

    pub(crate) fn allow(&self) {
        *self.refused.write() = None;
    }
}

#[cfg(test)]
impl Datagram for RefusingSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if *self.refused.read() == Some(addr) {
            return Err(io::Error::new(io::ErrorKind::Other, "send refused"));
        }
        self.socket.send_to(buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
