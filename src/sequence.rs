//! 시퀀스 번호 공간
//!
//! wire의 sequence id는 `max_id` 모듈러로 순환한다. 엔진은 0부터 단조 증가하는
//! 논리 패킷 번호를 사용하고, 송수신 시점에 wire id와 상호 변환한다.
//!
//! 송신측은 LAR을 넘어서 SWS개까지만 전송할 수 있고 LAR은 항상 수신측 LFR 이하이다.
//! 따라서 수신측에 도착하는 번호는 `(LFR - SWS, LFR + SWS]` 범위에 있고,
//! `max_id >= 2 * SWS`이면 wire id 하나가 정확히 한 번호로 대응된다.

/// 전송 하나의 논리 번호 ↔ wire id 매핑
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSpace {
    start_id: u32,
    max_id: u32,
    wrap_count: u64,
}

impl SequenceSpace {
    pub fn new(start_id: u32, max_id: u32) -> Self {
        debug_assert!(start_id < max_id, "start_id must be below max_id");
        Self {
            start_id,
            max_id,
            wrap_count: 0,
        }
    }

    pub fn start_id(&self) -> u32 {
        self.start_id
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    /// wire id가 max_id를 넘어 순환한 횟수
    pub fn wrap_count(&self) -> u64 {
        self.wrap_count
    }

    /// 번호 → wire id (상태 변화 없음)
    ///
    /// 음수 번호(-1 = 아직 아무것도 받지 못함)도 모듈러로 변환한다.
    pub fn wire_id(&self, number: i64) -> u32 {
        (number + self.start_id as i64).rem_euclid(self.max_id as i64) as u32
    }

    /// 송신측: 번호에 wire id를 할당하고 랩 카운트를 갱신
    pub fn assign(&mut self, number: u64) -> u32 {
        let absolute = number + self.start_id as u64;
        self.wrap_count = self.wrap_count.max(absolute / self.max_id as u64);
        (absolute % self.max_id as u64) as u32
    }

    /// 수신측: wire id → 논리 번호
    ///
    /// `LFR + 1`에서 앞으로의 거리 `d`가 `sws` 미만이면 현재 에포크의 번호,
    /// 아니면 이전 에포크에서 늦게 도착한 번호(LFR 이하)로 본다.
    pub fn number_of(&mut self, wire: u32, lfr: i64, sws: usize) -> i64 {
        let max = self.max_id as i64;
        let expected = lfr + 1;
        let distance = (wire as i64 - self.wire_id(expected) as i64).rem_euclid(max);

        let number = if distance < sws as i64 {
            expected + distance
        } else {
            expected + distance - max
        };

        if number >= 0 {
            let absolute = (number + self.start_id as i64) as u64;
            self.wrap_count = self.wrap_count.max(absolute / self.max_id as u64);
        }
        number
    }

    /// 송신측: 누적 ACK의 wire id → 번호
    ///
    /// `(lar, highest_sent]` 범위에 있을 때만 Some. 중복/오래된 ACK는 None.
    pub fn acked_number(&self, wire: u32, lar: i64, highest_sent: i64) -> Option<i64> {
        let next = lar + 1;
        let distance = (wire as i64 - self.wire_id(next) as i64).rem_euclid(self.max_id as i64);
        let number = next + distance;
        (number <= highest_sent).then_some(number)
    }
}
