use bytes::Bytes;

use crate::flow::Direction;

/// One ordered byte range of a conversation with its direction and
/// capture time. The bytes are shared, never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragment {
    data: Bytes,
    direction: Direction,
    timestamp_us: i64,
}

impl DataFragment {
    pub fn new(data: Bytes, direction: Direction, timestamp_us: i64) -> Self {
        Self {
            data,
            direction,
            timestamp_us,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of this fragment tagged with another direction; the payload
    /// is shared.
    pub(crate) fn retagged(&self, direction: Direction) -> Self {
        Self {
            data: self.data.clone(),
            direction,
            timestamp_us: self.timestamp_us,
        }
    }
}
