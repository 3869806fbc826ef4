//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: 単調増加 ULID（本番・テスト共通）

use crate::domain::ids::{JobId, ProcessId};
use crate::ports::Clock;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// Job ids double as the age tie-break in claim order, so an implementation
/// must hand out strictly increasing job ids within one store.
pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;

    fn generate_process_id(&self) -> ProcessId;
}

/// ULID generator driven by a `Clock`.
///
/// Uses `ulid::Generator`, so ids generated within the same millisecond (or
/// after the clock moved backwards) still increase.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
    generator: Mutex<ulid::Generator>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            generator: Mutex::new(ulid::Generator::new()),
        }
    }

    fn next(&self) -> Ulid {
        let at = SystemTime::from(self.clock.now());
        let mut generator = self.generator.lock().unwrap_or_else(|e| e.into_inner());
        // overflow of the random part within one millisecond; astronomically rare
        generator
            .generate_from_datetime(at)
            .unwrap_or_else(|_| Ulid::from_datetime(at))
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn generate_process_id(&self) -> ProcessId {
        ProcessId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));

        let id1 = id_gen.generate_job_id();
        let id2 = id_gen.generate_job_id();
        let id3 = id_gen.generate_job_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ids_increase_under_a_fixed_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(FixedClock::new(fixed_time)));

        let ids: Vec<JobId> = (0..100).map(|_| id_gen.generate_job_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        // timestamp 部分は固定時刻のまま
        assert_eq!(ids[0].as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(ids[99].as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn ids_keep_increasing_when_the_clock_goes_back() {
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(later));
        let id_gen = UlidGenerator::new(clock.clone());

        let first = id_gen.generate_job_id();
        clock.set(later - chrono::Duration::minutes(5));
        let second = id_gen.generate_job_id();

        assert!(first < second);
    }

    #[test]
    fn process_ids_have_their_own_prefix() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));
        assert!(id_gen.generate_process_id().to_string().starts_with("process-"));
    }
}
