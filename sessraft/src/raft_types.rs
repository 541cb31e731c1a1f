use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a log entry: the term in which it was created and its
/// position in the log.
///
/// Ordering is lexicographic on `(term, index)`, which is exactly the
/// "at least as up-to-date" comparison used by elections and pre-vote polls.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl From<(u64, u64)> for LogId {
    fn from((term, index): (u64, u64)) -> Self {
        Self { term, index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_id_ordering_prefers_term() {
        assert!(LogId::new(2, 1) > LogId::new(1, 100));
        assert!(LogId::new(2, 5) > LogId::new(2, 4));
        assert!(LogId::new(0, 0) < LogId::new(1, 1));
        assert_eq!(LogId::new(3, 7), LogId::new(3, 7));
    }
}
