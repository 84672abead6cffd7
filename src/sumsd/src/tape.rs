use async_trait::async_trait;
use std::collections::HashMap;
use sums_lib::{SumsError, SumsResult, Sunum};

/// Seam to a tape subsystem that can stage offline SUs back online.
#[async_trait]
pub trait TapeService: Send + Sync {
    /// Queues a read of `sunums` and returns the request id to poll.
    async fn request_read(&self, sunums: &[Sunum]) -> SumsResult<String>;

    async fn is_complete(&self, request_id: &str) -> SumsResult<bool>;
}

/// Installed when no tape hardware is integrated. Every call fails.
pub struct UnimplementedTape;

#[async_trait]
impl TapeService for UnimplementedTape {
    async fn request_read(&self, sunums: &[Sunum]) -> SumsResult<String> {
        Err(SumsError::Unsupported(format!(
            "tape read of {} storage units",
            sunums.len()
        )))
    }

    async fn is_complete(&self, request_id: &str) -> SumsResult<bool> {
        Err(SumsError::Unsupported(format!(
            "tape read status of {}",
            request_id
        )))
    }
}

/// A `get` waiting on a tape read. Finished by `poll` once the read is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredGet {
    pub sunums: Vec<Sunum>,
    pub touch: bool,
    pub retention: i64,
}

/// Tape reads started by one session, keyed by request id.
#[derive(Debug, Default)]
pub struct TapeReads {
    pending: HashMap<String, DeferredGet>,
}

impl TapeReads {
    pub fn insert(&mut self, request_id: String, get: DeferredGet) {
        self.pending.insert(request_id, get);
    }

    pub fn get(&self, request_id: &str) -> Option<&DeferredGet> {
        self.pending.get(request_id)
    }

    pub fn take(&mut self, request_id: &str) -> Option<DeferredGet> {
        self.pending.remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
