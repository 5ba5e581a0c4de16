use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlates an outgoing request with the adapter callbacks that answer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub i16);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out request IDs from a wrapping 16-bit counter.
///
/// IDs still held by a pending request are skipped, so an ID is never shared by
/// two outstanding requests even after the counter wraps.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    current: i16,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next free ID, or `None` if every ID is in use.
    pub fn next(&mut self, in_use: impl Fn(RequestId) -> bool) -> Option<RequestId> {
        for _ in 0..=u16::MAX as u32 {
            self.current = self.current.wrapping_add(1);
            let id = RequestId(self.current);
            if !in_use(id) {
                return Some(id);
            }
        }
        None
    }
}

/// The three ways a request can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestShape {
    /// Success or failure only.
    Completable,
    /// Exactly one value or a failure.
    Single,
    /// Zero or more events, then completion or failure.
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackableCategory {
    AttachmentDownload,
}

/// Semantic identity of an in-flight request, used to avoid issuing the same
/// logical operation twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackableKey {
    pub category: TrackableCategory,
    pub key: String,
}

impl TrackableKey {
    pub fn attachment_download(guid: impl Into<String>) -> Self {
        Self {
            category: TrackableCategory::AttachmentDownload,
            key: guid.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_start_at_one_and_increment() {
        let mut ids = RequestIdAllocator::new();
        assert_eq!(ids.next(|_| false), Some(RequestId(1)));
        assert_eq!(ids.next(|_| false), Some(RequestId(2)));
    }

    #[test]
    fn test_ids_wrap_around() {
        let mut ids = RequestIdAllocator { current: i16::MAX };
        assert_eq!(ids.next(|_| false), Some(RequestId(i16::MIN)));
    }

    #[test]
    fn test_pending_ids_are_skipped() {
        let mut ids = RequestIdAllocator::new();
        let pending: HashSet<RequestId> = [RequestId(1), RequestId(2)].into_iter().collect();
        assert_eq!(ids.next(|id| pending.contains(&id)), Some(RequestId(3)));
    }

    #[test]
    fn test_exhausted_ids() {
        let mut ids = RequestIdAllocator::new();
        assert_eq!(ids.next(|_| true), None);
    }
}
