//! 프로토콜 설정

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::frame::FrameCodec;
use crate::{Error, Result, DEFAULT_MAX_ID, HEADER_SIZE, MAX_PACKET_SIZE};

/// 재시도 정책 (핸드쉐이크, 세션 요청, 잘못된 데이터그램 백오프)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// 최대 시도 횟수
    pub attempts: u32,

    /// 첫 대기 시간 (밀리초)
    pub initial_delay_ms: u64,

    /// 시도마다 곱해지는 배수 (1.0이면 고정 간격)
    pub multiplier: f64,

    /// 대기 시간 상한 (밀리초)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 4000,
        }
    }
}

impl RetryPolicy {
    /// 고정 간격 정책
    pub fn fixed(attempts: u32, delay_ms: u64) -> Self {
        Self {
            attempts,
            initial_delay_ms: delay_ms,
            multiplier: 1.0,
            max_delay_ms: delay_ms,
        }
    }

    /// `attempt`번째(0부터) 시도의 대기 시간
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// SWFT 프로토콜 설정
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 최대 패킷 크기 (헤더 포함, 바이트)
    pub max_packet_size: usize,

    /// wire 시퀀스 ID 모듈러
    pub max_id: u32,

    /// 송신 윈도우 크기 (SWS, 패킷 수)
    pub send_window: usize,

    /// 수신 윈도우 크기 (RWS, 패킷 수). SWS 이하
    pub receive_window: usize,

    /// 재전송 타임아웃 (밀리초)
    pub retransmit_timeout_ms: u64,

    /// 재전송 비율 중단 임계값 (퍼센트)
    pub resend_threshold_percent: u64,

    /// 평상시 수신 폴링 타임아웃 (밀리초)
    pub recv_poll_ms: u64,

    /// 일시정지 중 수신 폴링 타임아웃 (밀리초)
    pub pause_poll_ms: u64,

    /// 수신 완료 후 중복 프레임에 재ACK하며 대기하는 시간 (밀리초)
    pub linger_ms: u64,

    /// 상대로부터 아무 프레임도 없을 때 수신을 포기하는 시간 (밀리초, 일시정지 중 제외)
    pub idle_timeout_ms: u64,

    /// 명령도 진행 중인 전송도 없는 세션을 닫는 시간 (밀리초)
    pub session_timeout_ms: u64,

    /// 타이머 스케줄러 틱 간격 (밀리초)
    pub scheduler_tick_ms: u64,

    /// 핸드쉐이크 / 세션 요청 재시도 정책
    pub request_retry: RetryPolicy,

    /// 수신 에러 후 백오프 정책
    pub error_backoff: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            max_id: DEFAULT_MAX_ID,
            send_window: 32,
            receive_window: 32,
            retransmit_timeout_ms: 1000,      // 1초
            resend_threshold_percent: 25,     // 25%
            recv_poll_ms: 500,
            pause_poll_ms: 50,
            linger_ms: 2000,
            idle_timeout_ms: 30_000,
            session_timeout_ms: 600_000,
            scheduler_tick_ms: 1,
            request_retry: RetryPolicy::default(),
            error_backoff: RetryPolicy {
                attempts: u32::MAX,
                initial_delay_ms: 5,
                multiplier: 2.0,
                max_delay_ms: 200,
            },
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 로컬 네트워크용 설정
    pub fn lan() -> Self {
        Self {
            send_window: 64,
            receive_window: 64,
            retransmit_timeout_ms: 200,
            recv_poll_ms: 200,
            linger_ms: 500,
            request_retry: RetryPolicy::fixed(5, 200),
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            max_packet_size: 512,
            send_window: 16,
            receive_window: 16,
            retransmit_timeout_ms: 1500,
            resend_threshold_percent: 60,
            linger_ms: 5000,
            request_retry: RetryPolicy {
                attempts: 10,
                ..RetryPolicy::default()
            },
            ..Self::default()
        }
    }

    /// 최대 페이로드 길이
    pub fn max_payload_len(&self) -> usize {
        self.max_packet_size.saturating_sub(HEADER_SIZE)
    }

    /// 설정된 크기로 코덱 생성
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_packet_size, self.max_id)
    }

    /// 파일 크기에 필요한 패킷 수
    pub fn packets_for(&self, total_size: u64) -> u64 {
        let payload = self.max_payload_len() as u64;
        total_size.div_ceil(payload)
    }

    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn recv_poll(&self) -> Duration {
        Duration::from_millis(self.recv_poll_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size <= HEADER_SIZE {
            return Err(Error::Config(format!(
                "max_packet_size({})는 헤더 크기({})보다 커야 함",
                self.max_packet_size, HEADER_SIZE
            )));
        }
        if self.send_window == 0 || self.receive_window == 0 {
            return Err(Error::Config("윈도우 크기는 1 이상이어야 함".into()));
        }
        if self.receive_window > self.send_window {
            return Err(Error::Config(format!(
                "RWS({}) > SWS({})",
                self.receive_window, self.send_window
            )));
        }
        if (self.max_id as u64) < 2 * self.send_window as u64 {
            return Err(Error::Config(format!(
                "max_id({})는 2 * SWS({}) 이상이어야 함",
                self.max_id, self.send_window
            )));
        }
        if self.scheduler_tick_ms == 0 {
            return Err(Error::Config("scheduler_tick_ms는 0일 수 없음".into()));
        }
        Ok(())
    }

    /// TOML 문자열에서 설정 파싱 (누락된 키는 기본값)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정 로드
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// TOML 문자열로 직렬화
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
