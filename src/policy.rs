//! 재전송 비율 중단 정책 및 수신 에러 백오프

use std::time::Duration;

use parking_lot::Mutex;

use crate::config::RetryPolicy;

/// 재전송 기록 후 판정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,

    /// 비율이 임계값을 넘음
    Abort { ratio: u64 },
}

/// 재전송 비율 정책
///
/// `ratio = resends * 100 / max(total_packets, 1)` (정수 나눗셈).
/// 증가와 비교를 같은 임계 구역에서 수행한다.
#[derive(Debug)]
pub struct ResendPolicy {
    threshold_percent: u64,
    total_packets: u64,
    resends: Mutex<u64>,
}

impl ResendPolicy {
    pub fn new(threshold_percent: u64, total_packets: u64) -> Self {
        Self {
            threshold_percent,
            total_packets,
            resends: Mutex::new(0),
        }
    }

    /// 재전송 1회 기록
    pub fn record_resend(&self) -> Verdict {
        let mut resends = self.resends.lock();
        *resends += 1;
        let ratio = *resends * 100 / self.total_packets.max(1);
        if ratio > self.threshold_percent {
            Verdict::Abort { ratio }
        } else {
            Verdict::Continue
        }
    }

    pub fn resends(&self) -> u64 {
        *self.resends.lock()
    }

    pub fn ratio(&self) -> u64 {
        *self.resends.lock() * 100 / self.total_packets.max(1)
    }
}

/// 연속 수신 에러에 대한 지수 백오프
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// 다음 대기 시간. 시도 횟수를 모두 쓰면 None
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.attempts {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// 정상 수신 후 초기화
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
