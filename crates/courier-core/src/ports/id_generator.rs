//! IdGenerator port - ID 生成の抽象化
//!
//! 新しい JobRecord に `uniqueId` を割り当てます。
//! テストでは FixedClock と組み合わせて使えます。

use crate::domain::JobRecordId;
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_job_record_id(&self) -> JobRecordId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// timestamp 部分は Clock から、残りは乱数から作るため、
/// FixedClock の下でも ID が重複しません。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_record_id(&self) -> JobRecordId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        JobRecordId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
