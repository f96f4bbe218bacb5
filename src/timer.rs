//! 재전송 타이머 스케줄러
//!
//! 프로세스 공용 타이머 서비스. 엔진은 프레임을 보낼 때마다 `(지연, 핸들러, 태그)`를
//! 등록하고, 백그라운드 스레드가 약 1ms 간격으로 만료된 항목을 꺼내
//! **락 밖에서** 핸들러를 호출한다. 핸들러 안에서 다시 `schedule`을 호출해도
//! 데드락이 없다.
//!
//! 전역 상태가 아니라 복제 가능한 핸들을 엔진에 주입한다.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::frame::Frame;
use crate::{Error, Result};

/// 타임아웃 발생 시 호출되는 핸들러
pub trait TimeoutHandler: Send + Sync {
    fn on_timeout(&self, tag: Frame);
}

/// 등록된 타이머 하나
struct TimeoutEntry {
    handler: Arc<dyn TimeoutHandler>,
    tag: Frame,
}

struct SchedulerInner {
    /// 기준 시각 (버킷 키는 이 시각부터의 밀리초)
    epoch: Instant,

    /// 만료 시각(ms) → 같은 버킷의 항목들 (삽입 순서 유지)
    buckets: Mutex<BTreeMap<u64, Vec<TimeoutEntry>>>,

    running: AtomicBool,

    worker: Mutex<Option<JoinHandle<()>>>,

    tick: Duration,
}

/// 타이머 스케줄러 핸들
#[derive(Clone)]
pub struct TimeoutScheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl TimeoutScheduler {
    /// 새 스케줄러 (아직 시작하지 않음)
    pub fn new(tick: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                epoch: Instant::now(),
                buckets: Mutex::new(BTreeMap::new()),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
                tick,
            }),
        }
    }

    /// 백그라운드 틱 스레드 시작. 이미 실행 중이면 에러
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Scheduler("이미 시작됨"));
        }

        let scheduler = self.clone();
        let worker = std::thread::Builder::new()
            .name("swft-timer".into())
            .spawn(move || {
                while scheduler.inner.running.load(Ordering::SeqCst) {
                    scheduler.fire_due(Instant::now());
                    std::thread::sleep(scheduler.inner.tick);
                }
                debug!("타이머 스레드 종료");
            });

        match worker {
            Ok(handle) => {
                *self.inner.worker.lock() = Some(handle);
                info!("Timeout scheduler started (tick {:?})", self.inner.tick);
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(Error::Io(e))
            }
        }
    }

    /// 틱 스레드 정지. 시작 전이면 에러
    ///
    /// 등록된 항목은 버려진다.
    pub fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Scheduler("시작되지 않음"));
        }

        let worker = self.inner.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        self.inner.buckets.lock().clear();
        info!("Timeout scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// 일회성 타이머 등록
    ///
    /// 정지 상태에서도 등록은 되며, `start` 이후나 `fire_due` 호출 시 발화한다.
    pub fn schedule(&self, delay: Duration, handler: Arc<dyn TimeoutHandler>, tag: Frame) {
        let deadline = self.deadline_ms(Instant::now() + delay);
        self.inner
            .buckets
            .lock()
            .entry(deadline)
            .or_default()
            .push(TimeoutEntry { handler, tag });
    }

    /// `now`까지 만료된 모든 항목을 발화하고 발화 개수를 반환
    pub fn fire_due(&self, now: Instant) -> usize {
        let now_ms = self.deadline_ms(now);

        let expired: Vec<TimeoutEntry> = {
            let mut buckets = self.inner.buckets.lock();
            let later = buckets.split_off(&(now_ms + 1));
            let due = std::mem::replace(&mut *buckets, later);
            due.into_values().flatten().collect()
        };

        let fired = expired.len();
        for entry in expired {
            entry.handler.on_timeout(entry.tag);
        }
        fired
    }

    /// 등록되어 아직 발화하지 않은 항목 수
    pub fn pending(&self) -> usize {
        self.inner.buckets.lock().values().map(Vec::len).sum()
    }

    fn deadline_ms(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.inner.epoch).as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<u32>>,
    }

    impl TimeoutHandler for Recorder {
        fn on_timeout(&self, tag: Frame) {
            self.fired.lock().push(tag.sequence_id);
        }
    }

    /// 발화 시 자기 자신을 한 번 다시 등록
    struct Rearm {
        scheduler: TimeoutScheduler,
        count: Mutex<u32>,
        me: Mutex<Option<Arc<Rearm>>>,
    }

    impl TimeoutHandler for Rearm {
        fn on_timeout(&self, tag: Frame) {
            let mut count = self.count.lock();
            *count += 1;
            if *count == 1 {
                if let Some(me) = self.me.lock().take() {
                    self.scheduler.schedule(Duration::ZERO, me, tag);
                }
            }
        }
    }

    fn tag(id: u32) -> Frame {
        Frame::data(id, Bytes::new())
    }

    #[test]
    fn test_lifecycle_errors() {
        let scheduler = TimeoutScheduler::default();
        assert!(matches!(scheduler.stop(), Err(Error::Scheduler(_))));
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(Error::Scheduler(_))));
        scheduler.stop().unwrap();
        assert!(matches!(scheduler.stop(), Err(Error::Scheduler(_))));
    }

    #[test]
    fn test_fire_due_with_fabricated_clock() {
        let scheduler = TimeoutScheduler::default();
        let recorder = Arc::new(Recorder::default());
        let now = Instant::now();

        scheduler.schedule(Duration::from_millis(100), recorder.clone(), tag(1));
        scheduler.schedule(Duration::from_millis(100), recorder.clone(), tag(2));
        scheduler.schedule(Duration::from_millis(500), recorder.clone(), tag(3));
        assert_eq!(scheduler.pending(), 3);

        assert_eq!(scheduler.fire_due(now), 0);
        assert_eq!(scheduler.fire_due(now + Duration::from_millis(200)), 2);
        assert_eq!(*recorder.fired.lock(), vec![1, 2]);

        // 같은 항목이 두 번 발화하지 않음
        assert_eq!(scheduler.fire_due(now + Duration::from_millis(200)), 0);

        assert_eq!(scheduler.fire_due(now + Duration::from_secs(1)), 1);
        assert_eq!(*recorder.fired.lock(), vec![1, 2, 3]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_handler_can_reschedule_without_deadlock() {
        let scheduler = TimeoutScheduler::default();
        let rearm = Arc::new(Rearm {
            scheduler: scheduler.clone(),
            count: Mutex::new(0),
            me: Mutex::new(None),
        });
        *rearm.me.lock() = Some(rearm.clone());

        scheduler.schedule(Duration::ZERO, rearm.clone(), tag(7));
        let later = Instant::now() + Duration::from_millis(10);
        assert_eq!(scheduler.fire_due(later), 1);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.fire_due(later + Duration::from_millis(10)), 1);
        assert_eq!(*rearm.count.lock(), 2);
    }

    #[test]
    fn test_background_thread_fires() {
        let scheduler = TimeoutScheduler::default();
        let recorder = Arc::new(Recorder::default());
        scheduler.start().unwrap();

        scheduler.schedule(Duration::from_millis(5), recorder.clone(), tag(9));

        let deadline = Instant::now() + Duration::from_secs(2);
        while recorder.fired.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        scheduler.stop().unwrap();

        assert_eq!(*recorder.fired.lock(), vec![9]);
    }
}
