//! 处理位点（ProcessingPosition）
//!
//! `stream_position` 为派生流内的序号，`log_position` 为其对应的事件日志位点。
//! 成功运行期间严格单调递增，只有重定位可以让它回退。
//!
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProcessingPosition {
    stream_position: u64,
    log_position: u64,
}

impl ProcessingPosition {
    pub const START: Self = Self::new(0, 0);

    pub const fn new(stream_position: u64, log_position: u64) -> Self {
        Self {
            stream_position,
            log_position,
        }
    }

    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    pub fn log_position(&self) -> u64 {
        self.log_position
    }

    /// 越过一个位于当前位点的事件之后的位点；到达 `u64::MAX` 后不再前进
    pub fn next(&self) -> Self {
        Self::new(
            self.stream_position.saturating_add(1),
            self.log_position.saturating_add(1),
        )
    }

    pub fn is_start(&self) -> bool {
        *self == Self::START
    }
}

impl fmt::Display for ProcessingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.stream_position, self.log_position)
    }
}
