//! 손실 시뮬레이터
//!
//! 실제 UDP 소켓을 감싸 송신 데이터그램을 시드 고정 난수로 드롭/복제한다.
//! 같은 시드면 같은 드롭 패턴이 나오므로 테스트 실패를 재현할 수 있다.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::channel::Datagram;
use crate::HEADER_SIZE;

/// 드롭 대상
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropFilter {
    /// 모든 데이터그램
    All,

    /// 데이터 프레임만 (문자열 오프셋 0, 페이로드 있음)
    DataOnly,
}

/// 장애 주입 모델
#[derive(Debug, Clone)]
pub struct LossModel {
    /// 드롭 확률 [0.0, 1.0]
    pub loss_rate: f64,

    /// 복제 확률 [0.0, 1.0]
    pub duplicate_rate: f64,

    pub filter: DropFilter,

    pub seed: u64,
}

impl Default for LossModel {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            filter: DropFilter::All,
            seed: 0,
        }
    }
}

impl LossModel {
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            seed,
            ..Self::default()
        }
    }

    pub fn data_only(mut self) -> Self {
        self.filter = DropFilter::DataOnly;
        self
    }
}

/// 장애 주입 UDP 소켓
pub struct LossySocket {
    socket: UdpSocket,
    model: LossModel,
    rng: Mutex<StdRng>,
    dropped: AtomicU64,
    duplicated: AtomicU64,
}

impl LossySocket {
    pub fn bind(addr: impl ToSocketAddrs, model: LossModel) -> io::Result<Self> {
        Ok(Self::wrap(UdpSocket::bind(addr)?, model))
    }

    pub fn wrap(socket: UdpSocket, model: LossModel) -> Self {
        Self {
            socket,
            rng: Mutex::new(StdRng::seed_from_u64(model.seed)),
            model,
            dropped: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
        }
    }

    /// 드롭된 데이터그램 수
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn duplicated(&self) -> u64 {
        self.duplicated.load(Ordering::Relaxed)
    }

    fn eligible(&self, buf: &[u8]) -> bool {
        match self.model.filter {
            DropFilter::All => true,
            DropFilter::DataOnly => {
                buf.len() > HEADER_SIZE && buf.get(8..12) == Some(&[0, 0, 0, 0][..])
            }
        }
    }
}

impl Datagram for LossySocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.eligible(buf) {
            let (drop, duplicate) = {
                let mut rng = self.rng.lock();
                (
                    rng.gen_bool(self.model.loss_rate.clamp(0.0, 1.0)),
                    rng.gen_bool(self.model.duplicate_rate.clamp(0.0, 1.0)),
                )
            };

            if drop {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("시뮬레이터 드롭: {} bytes → {}", buf.len(), addr);
                return Ok(buf.len());
            }
            if duplicate {
                self.duplicated.fetch_add(1, Ordering::Relaxed);
                self.socket.send_to(buf, addr)?;
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TransportChannel;
    use crate::frame::{Frame, FrameCodec};
    use crate::Error;
    use bytes::Bytes;
    use std::sync::Arc;

    fn sink() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        socket
    }

    fn drain(socket: &UdpSocket) -> usize {
        let mut buf = [0u8; 2048];
        let mut count = 0;
        while socket.recv_from(&mut buf).is_ok() {
            count += 1;
        }
        count
    }

    #[test]
    fn test_same_seed_same_drop_pattern() {
        let pattern = |seed| {
            let lossy = LossySocket::bind("127.0.0.1:0", LossModel::lossy(0.5, seed)).unwrap();
            let target = sink();
            let addr = target.local_addr().unwrap();
            (0..40)
                .map(|_| {
                    let before = lossy.dropped();
                    lossy.send_to(&[0u8; 16], addr).unwrap();
                    lossy.dropped() > before
                })
                .collect::<Vec<bool>>()
        };

        assert_eq!(pattern(7), pattern(7));
        assert!(pattern(7).iter().any(|d| *d));
        assert!(pattern(7).iter().any(|d| !*d));
    }

    #[test]
    fn test_data_only_filter_spares_control_frames() {
        let lossy = Arc::new(
            LossySocket::bind("127.0.0.1:0", LossModel::lossy(1.0, 1).data_only()).unwrap(),
        );
        let channel = TransportChannel::from_datagram(lossy.clone(), FrameCodec::default()).unwrap();
        let target = sink();
        let addr = target.local_addr().unwrap();

        channel.send(&Frame::control(1, "ACK"), addr).unwrap();
        channel
            .send(&Frame::data(2, Bytes::from_static(b"payload")), addr)
            .unwrap();

        assert_eq!(drain(&target), 1);
        assert_eq!(lossy.dropped(), 1);
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let lossy = Arc::new(LossySocket::bind("127.0.0.1:0", LossModel::lossy(1.0, 3)).unwrap());
        let sender = TransportChannel::from_datagram(lossy.clone(), FrameCodec::default()).unwrap();
        let receiver = TransportChannel::bind("127.0.0.1:0", FrameCodec::default()).unwrap();

        for id in 0..5 {
            sender
                .send(&Frame::control(id, "START"), receiver.local_addr())
                .unwrap();
        }

        assert!(matches!(
            receiver.receive(Duration::from_millis(50)),
            Err(Error::Timeout)
        ));
        assert_eq!(lossy.dropped(), 5);
    }

    #[test]
    fn test_duplication() {
        let model = LossModel {
            duplicate_rate: 1.0,
            ..LossModel::default()
        };
        let lossy = LossySocket::bind("127.0.0.1:0", model).unwrap();
        let target = sink();
        lossy
            .send_to(&[0u8; 16], target.local_addr().unwrap())
            .unwrap();

        assert_eq!(drain(&target), 2);
        assert_eq!(lossy.duplicated(), 1);
    }
}
