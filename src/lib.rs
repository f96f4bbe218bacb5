//! # SWFT (Sliding Window File Transfer)
//!
//! UDP 기반 ACK 슬라이딩 윈도우 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **누적 ACK**: 수신측이 연속 수신한 마지막 번호(LFR)를 ACK
//! - **슬라이딩 윈도우**: 고정 크기 송신(SWS)/수신(RWS) 윈도우
//! - **프레임별 재전송 타이머**: 프로세스 공용 [`TimeoutScheduler`]
//! - **시퀀스 랩어라운드**: MAX_ID 모듈러 wire id 위의 논리 번호 공간
//! - **세션 핸드쉐이크**: 랑데부 포트에서 클라이언트별 임시 채널 할당
//! - **일시정지/재개**: 제어 프레임 기반 협조적 정지
//! - **재전송 비율 중단**: 링크 품질이 나쁘면 전송 포기

pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod policy;
pub mod receiver;
pub mod sender;
pub mod sequence;
pub mod session;
pub mod simulator;
pub mod stats;
pub mod store;
pub mod timer;
pub mod transfer;

pub use channel::{Datagram, TransportChannel};
pub use config::{Config, RetryPolicy};
pub use controller::{local_bind_addr, ClientController};
pub use error::{Error, FrameError, Result};
pub use frame::{Frame, FrameCodec};
pub use handshake::{handshake, AcceptorHandle, SessionAcceptor};
pub use message::{Command, ControlToken, Reply};
pub use policy::{Backoff, ResendPolicy, Verdict};
pub use receiver::{DownloadEngine, RecvPhase};
pub use sender::{SendPhase, UploadEngine};
pub use sequence::SequenceSpace;
pub use session::ClientSession;
pub use simulator::{DropFilter, LossModel, LossySocket};
pub use stats::{TransferReport, TransferStats};
pub use store::{persist_atomic, DirStore, FileStore};
pub use timer::{TimeoutHandler, TimeoutScheduler};
pub use transfer::{
    random_start_id, Direction, Role, SilentObserver, TransferHandle, TransferId, TransferLink,
    TransferObserver,
};

/// 기본 최대 패킷 크기 (바이트, 헤더 포함)
pub const MAX_PACKET_SIZE: usize = 1024;

/// 고정 헤더 크기: id(4) + header_len(4) + string_offset(4)
pub const HEADER_SIZE: usize = 12;

/// 기본 최대 페이로드 길이
pub const MAX_PAYLOAD_LENGTH: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// 기본 wire 시퀀스 ID 모듈러
pub const DEFAULT_MAX_ID: u32 = i32::MAX as u32;

/// 텍스트 명령 구분자
pub const DELIMITER: char = ';';
