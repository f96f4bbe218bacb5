//! 전송 통계

use std::fmt;
use std::time::{Duration, Instant};

use crate::transfer::{Direction, TransferId};

/// 엔진 하나의 진행 중 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    pub id: TransferId,

    pub direction: Direction,

    /// 파일 전체 크기
    pub total_bytes: u64,

    /// 전달 확인된 바이트 (송신: ACK 기준, 수신: 조립 기준)
    pub bytes_done: u64,

    /// 전체 데이터 패킷 수
    pub total_packets: u64,

    /// 처음 전송한 프레임 수 (재전송 제외)
    pub frames_sent: u64,

    /// 피어에서 받은 프레임 수
    pub frames_received: u64,

    /// 재전송 횟수
    pub resent: u64,

    /// 윈도우 밖이라 버린 프레임 수
    pub dropped: u64,

    /// 이미 받은 번호의 중복 프레임 수
    pub duplicates: u64,

    /// 일시정지 구간을 제외한 누적 활성 시간
    active: Duration,

    /// 현재 활성 구간의 시작 (정지/일시정지 중이면 None)
    running_since: Option<Instant>,
}

impl TransferStats {
    pub fn new(id: TransferId, direction: Direction, total_bytes: u64, total_packets: u64) -> Self {
        Self {
            id,
            direction,
            total_bytes,
            bytes_done: 0,
            total_packets,
            frames_sent: 0,
            frames_received: 0,
            resent: 0,
            dropped: 0,
            duplicates: 0,
            active: Duration::ZERO,
            running_since: None,
        }
    }

    /// 시간 측정 시작 (이미 진행 중이면 무시)
    pub fn start_clock(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    /// 일시정지: 현재 구간을 누적 시간에 더함
    pub fn pause_clock(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.active += since.elapsed();
        }
    }

    /// 재개: 새 구간 시작
    pub fn resume_clock(&mut self) {
        self.start_clock();
    }

    /// 일시정지 구간을 뺀 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.active + self.running_since.map_or(Duration::ZERO, |since| since.elapsed())
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / secs
    }

    /// 최종 보고서 생성
    pub fn report(&self, completed: bool) -> TransferReport {
        TransferReport {
            id: self.id,
            direction: self.direction,
            bytes: self.bytes_done,
            total_bytes: self.total_bytes,
            duration: self.elapsed(),
            throughput: self.throughput(),
            frames_sent: self.frames_sent,
            resent: self.resent,
            dropped: self.dropped,
            duplicates: self.duplicates,
            completed,
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Bytes: {}/{} | Throughput: {:.2} KB/s | Resent: {} | Dropped: {}",
            self.elapsed().as_secs_f64(),
            self.bytes_done,
            self.total_bytes,
            self.throughput() / 1_000.0,
            self.resent,
            self.dropped,
        )
    }
}

/// 전송 종료 시 보고되는 최종 통계
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub id: TransferId,
    pub direction: Direction,
    pub bytes: u64,
    pub total_bytes: u64,
    pub duration: Duration,
    /// bytes/sec
    pub throughput: f64,
    pub frames_sent: u64,
    pub resent: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub completed: bool,
}

impl TransferReport {
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Transfer {} ({}) ===", self.id, self.direction)?;
        writeln!(f, "Bytes:      {}/{}", self.bytes, self.total_bytes)?;
        writeln!(f, "Duration:   {:.3}s", self.duration.as_secs_f64())?;
        writeln!(f, "Throughput: {:.2} KB/s", self.throughput / 1_000.0)?;
        writeln!(f, "Frames:     {} sent, {} resent", self.frames_sent, self.resent)?;
        writeln!(f, "Dropped:    {} ({} duplicates)", self.dropped, self.duplicates)?;
        write!(
            f,
            "Status:     {}",
            if self.completed { "COMPLETE" } else { "INCOMPLETE" }
        )
    }
}
