//! 에러 타입 정의

use thiserror::Error;

/// 프레임 인코딩/디코딩 에러
///
/// 단일 프레임에만 치명적이며 전송 자체는 계속된다 (드롭 후 다음 수신).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("헤더보다 짧은 데이터그램: {len} bytes")]
    Truncated { len: usize },

    #[error("유효하지 않은 헤더 길이: expected {expected}, got {got}")]
    HeaderLength { expected: u32, got: u32 },

    #[error("시퀀스 ID 범위 초과: id={id}, max_id={max_id}")]
    IdOutOfRange { id: u32, max_id: u32 },

    #[error("최대 패킷 크기 초과: {size} > {max}")]
    Oversized { size: usize, max: usize },

    #[error("문자열 오프셋이 페이로드를 넘음: offset={offset}, payload_len={payload_len}")]
    OffsetBeyondPayload { offset: u32, payload_len: usize },
}

/// SWFT 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("프레임 에러: {0}")]
    Frame(#[from] FrameError),

    #[error("전송 에러: {0}")]
    Transport(String),

    /// 블로킹 수신 타임아웃. 호출자는 재폴링한다.
    #[error("수신 타임아웃")]
    Timeout,

    #[error("채널이 닫힘")]
    ChannelClosed,

    #[error("세션 에러: {0}")]
    Session(String),

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("스케줄러 에러: {0}")]
    Scheduler(&'static str),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("파일 저장소 에러: {0}")]
    Store(String),

    #[error("알 수 없는 전송: transfer_id={0}")]
    UnknownTransfer(u32),
}

impl Error {
    /// 재시도하면 되는 일시적 에러 여부
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout | Error::Frame(_) | Error::Protocol(_))
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
