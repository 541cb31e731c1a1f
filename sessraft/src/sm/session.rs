//! Client session state, owned by the state-machine context.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ClientError;
use crate::raft::QueryResponse;
use crate::raft::RaftRespTx;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::MemberId;
use crate::SessionId;

/// The lifecycle state of a session. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum SessionState {
    Open,
    Expired,
    Closed,
}

/// A command result cached for deduplication of retries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CachedResult<R: AppDataResponse> {
    /// The log index at which the command applied.
    pub index: u64,
    /// The state machine's response, or the application error text.
    #[serde(bound = "R: AppDataResponse")]
    pub result: Result<R, String>,
}

/// A batch of events published while applying a single entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct EventBatch<E: AppEvent> {
    /// The log index at which the events were produced.
    pub event_index: u64,
    /// The index of the previous batch on this session.
    pub previous_index: u64,
    #[serde(bound = "E: AppEvent")]
    pub events: Vec<E>,
}

/// A query parked on a session until its sequence or index gate is
/// satisfied.
pub(crate) struct ParkedQuery<D: AppData, R: AppDataResponse> {
    pub data: D,
    pub min_index: u64,
    pub tx: RaftRespTx<QueryResponse<R>, ClientError>,
}

/// A client session.
///
/// The session's ID equals the index of the open-session entry which
/// registered it. All mutation happens on the state-machine context.
pub(crate) struct Session<D: AppData, R: AppDataResponse, E: AppEvent> {
    pub id: SessionId,
    /// The member through which the session's client is connected.
    pub member: MemberId,
    pub name: String,
    pub kind: String,
    /// The session timeout in milliseconds.
    pub timeout: u64,
    pub state: SessionState,
    /// The state-machine time of the last keep-alive or command.
    pub timestamp: u64,
    /// The highest command sequence applied for this session.
    pub command_sequence: u64,
    /// The highest log index this session has observed.
    pub last_applied: u64,
    /// The log index of the most recent event batch.
    pub event_index: u64,
    /// The highest event index acknowledged by the client.
    pub complete_index: u64,
    command_low_water_mark: u64,
    results: BTreeMap<u64, CachedResult<R>>,
    events: VecDeque<EventBatch<E>>,
    current_batch: Option<EventBatch<E>>,
    sequence_queries: BTreeMap<u64, Vec<ParkedQuery<D, R>>>,
    index_queries: BTreeMap<u64, Vec<ParkedQuery<D, R>>>,
}

impl<D: AppData, R: AppDataResponse, E: AppEvent> Session<D, R, E> {
    pub fn new(id: SessionId, member: MemberId, name: String, kind: String, timeout: u64, timestamp: u64) -> Self {
        Self {
            id,
            member,
            name,
            kind,
            timeout,
            state: SessionState::Open,
            timestamp,
            command_sequence: 0,
            last_applied: id,
            event_index: id,
            complete_index: id,
            command_low_water_mark: 0,
            results: BTreeMap::new(),
            events: VecDeque::new(),
            current_batch: None,
            sequence_queries: BTreeMap::new(),
            index_queries: BTreeMap::new(),
        }
    }

    /// Refresh the session timestamp; time never moves backwards.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = std::cmp::max(self.timestamp, timestamp);
    }

    /// Whether the session has outlived its timeout as of `now`.
    pub fn is_stale(&self, now: u64) -> bool {
        self.timestamp + self.timeout < now
    }

    /// Record a command result against its sequence number.
    ///
    /// Results are retained until the client acknowledges receipt, so that a
    /// retried command returns the original result.
    pub fn register_result(&mut self, sequence: u64, index: u64, result: Result<R, String>) {
        self.results.insert(sequence, CachedResult { index, result });
    }

    /// The cached result for a sequence number, if still retained.
    pub fn get_result(&self, sequence: u64) -> Option<&CachedResult<R>> {
        self.results.get(&sequence)
    }

    /// Clear cached results up to and including the acknowledged sequence.
    pub fn clear_results(&mut self, sequence: u64) {
        if sequence > self.command_low_water_mark {
            for seq in self.command_low_water_mark + 1..=sequence {
                self.results.remove(&seq);
            }
            self.command_low_water_mark = sequence;
        }
    }

    /// Advance the applied command sequence, draining queries parked on the
    /// sequence gate.
    pub fn set_command_sequence(&mut self, sequence: u64) -> Vec<ParkedQuery<D, R>> {
        let mut drained = Vec::new();
        while self.command_sequence < sequence {
            self.command_sequence += 1;
            if let Some(queries) = self.sequence_queries.remove(&self.command_sequence) {
                drained.extend(queries);
            }
        }
        drained
    }

    /// Advance the session's applied index, draining queries parked on the
    /// index gate.
    pub fn set_last_applied(&mut self, index: u64) -> Vec<ParkedQuery<D, R>> {
        let mut drained = Vec::new();
        while self.last_applied < index {
            self.last_applied += 1;
            if let Some(queries) = self.index_queries.remove(&self.last_applied) {
                drained.extend(queries);
            }
        }
        drained
    }

    /// Park a query until the session's command sequence reaches `sequence`.
    pub fn register_sequence_query(&mut self, sequence: u64, query: ParkedQuery<D, R>) {
        self.sequence_queries.entry(sequence).or_default().push(query);
    }

    /// Park a query until the session's applied index reaches `index`.
    pub fn register_index_query(&mut self, index: u64, query: ParkedQuery<D, R>) {
        self.index_queries.entry(index).or_default().push(query);
    }

    /// Take every parked query, used when the session terminates.
    pub fn drain_queries(&mut self) -> Vec<ParkedQuery<D, R>> {
        let mut drained = Vec::new();
        for (_, queries) in std::mem::take(&mut self.sequence_queries) {
            drained.extend(queries);
        }
        for (_, queries) in std::mem::take(&mut self.index_queries) {
            drained.extend(queries);
        }
        drained
    }

    /// Add an event published while applying the entry at `index`.
    ///
    /// Events for one index accumulate into a single batch; the batch's
    /// `previous_index` links to the prior batch for client gap detection.
    pub fn publish(&mut self, index: u64, event: E) {
        if self.complete_index > index {
            // The client already acknowledged past this index through
            // another server.
            return;
        }
        let start_new = match &self.current_batch {
            Some(batch) => batch.event_index != index,
            None => true,
        };
        if start_new {
            let previous_index = self.event_index;
            self.event_index = index;
            self.current_batch = Some(EventBatch {
                event_index: index,
                previous_index,
                events: Vec::new(),
            });
        }
        if let Some(batch) = &mut self.current_batch {
            batch.events.push(event);
        }
    }

    /// Seal the event batch for the entry at `index`, if one accumulated,
    /// returning it for transmission.
    pub fn commit_events(&mut self, index: u64) -> Option<EventBatch<E>> {
        match self.current_batch.take() {
            Some(batch) if batch.event_index == index => {
                self.events.push_back(batch.clone());
                Some(batch)
            }
            other => {
                self.current_batch = other;
                None
            }
        }
    }

    /// Discard batches acknowledged up to `index`.
    pub fn clear_events(&mut self, index: u64) {
        if index > self.complete_index {
            while let Some(batch) = self.events.front() {
                if batch.event_index > index {
                    break;
                }
                self.events.pop_front();
            }
            self.complete_index = index;
        }
    }

    /// Discard batches up to `index` and return the remainder for
    /// retransmission.
    pub fn resend_events(&mut self, index: u64) -> Vec<EventBatch<E>> {
        self.clear_events(index);
        self.events.iter().cloned().collect()
    }

    pub fn pending_event_batches(&self) -> usize {
        self.events.len()
    }

    /// Capture the durable portion of the session for a snapshot.
    pub fn to_snapshot(&self) -> SessionSnapshot<R, E> {
        SessionSnapshot {
            id: self.id,
            member: self.member,
            name: self.name.clone(),
            kind: self.kind.clone(),
            timeout: self.timeout,
            timestamp: self.timestamp,
            command_sequence: self.command_sequence,
            last_applied: self.last_applied,
            event_index: self.event_index,
            complete_index: self.complete_index,
            command_low_water_mark: self.command_low_water_mark,
            results: self.results.clone(),
            events: self.events.clone(),
        }
    }

    /// Rebuild a session from its snapshot form.
    pub fn from_snapshot(snap: SessionSnapshot<R, E>) -> Self {
        Self {
            id: snap.id,
            member: snap.member,
            name: snap.name,
            kind: snap.kind,
            timeout: snap.timeout,
            state: SessionState::Open,
            timestamp: snap.timestamp,
            command_sequence: snap.command_sequence,
            last_applied: snap.last_applied,
            event_index: snap.event_index,
            complete_index: snap.complete_index,
            command_low_water_mark: snap.command_low_water_mark,
            results: snap.results,
            events: snap.events,
            current_batch: None,
            sequence_queries: BTreeMap::new(),
            index_queries: BTreeMap::new(),
        }
    }
}

/// The serialized form of a session inside a snapshot. Parked queries are
/// volatile and not captured.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SessionSnapshot<R: AppDataResponse, E: AppEvent> {
    pub id: SessionId,
    pub member: MemberId,
    pub name: String,
    pub kind: String,
    pub timeout: u64,
    pub timestamp: u64,
    pub command_sequence: u64,
    pub last_applied: u64,
    pub event_index: u64,
    pub complete_index: u64,
    pub command_low_water_mark: u64,
    #[serde(bound = "R: AppDataResponse")]
    pub results: BTreeMap<u64, CachedResult<R>>,
    #[serde(bound = "E: AppEvent")]
    pub events: VecDeque<EventBatch<E>>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    impl crate::AppData for String {}
    impl crate::AppDataResponse for u64 {}
    impl crate::AppEvent for u32 {}

    type TestSession = Session<String, u64, u32>;

    fn session() -> TestSession {
        Session::new(5, 1, "s".into(), "kv".into(), 1000, 100)
    }

    #[test]
    fn test_result_cache_retains_until_acked() {
        let mut s = session();
        s.register_result(1, 6, Ok(10));
        s.register_result(2, 7, Ok(20));
        assert_eq!(s.get_result(1).unwrap().result, Ok(10));

        s.clear_results(1);
        assert!(s.get_result(1).is_none());
        assert_eq!(s.get_result(2).unwrap().result, Ok(20));

        // Acknowledgments never regress.
        s.clear_results(0);
        assert_eq!(s.get_result(2).unwrap().result, Ok(20));
    }

    #[test]
    fn test_command_sequence_drains_parked_queries_in_order() {
        let mut s = session();
        let (tx1, _rx1) = tokio::sync::oneshot::channel();
        let (tx2, _rx2) = tokio::sync::oneshot::channel();
        s.register_sequence_query(2, ParkedQuery {
            data: "q2".to_string(),
            min_index: 0,
            tx: tx1,
        });
        s.register_sequence_query(3, ParkedQuery {
            data: "q3".to_string(),
            min_index: 0,
            tx: tx2,
        });

        let drained = s.set_command_sequence(2);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].data, "q2");
        assert_eq!(s.command_sequence, 2);

        let drained = s.set_command_sequence(5);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].data, "q3");
        assert_eq!(s.command_sequence, 5);
    }

    #[test]
    fn test_event_batches_accumulate_per_index() {
        let mut s = session();
        s.publish(8, 1);
        s.publish(8, 2);
        let batch = s.commit_events(8).expect("a batch at index 8");
        assert_eq!(batch.event_index, 8);
        assert_eq!(batch.previous_index, 5);
        assert_eq!(batch.events, vec![1, 2]);
        assert_eq!(s.pending_event_batches(), 1);

        s.publish(9, 3);
        let batch = s.commit_events(9).unwrap();
        assert_eq!(batch.previous_index, 8);
        assert_eq!(s.pending_event_batches(), 2);
    }

    #[test]
    fn test_reset_discards_acked_batches_and_resends_rest() {
        let mut s = session();
        s.publish(8, 1);
        s.commit_events(8);
        s.publish(9, 2);
        s.commit_events(9);

        let resend = s.resend_events(8);
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].event_index, 9);
        assert_eq!(s.complete_index, 8);

        let resend = s.resend_events(9);
        assert!(resend.is_empty());
        assert_eq!(s.pending_event_batches(), 0);
    }

    #[test]
    fn test_staleness_follows_timestamp_and_timeout() {
        let mut s = session();
        assert!(!s.is_stale(1000));
        assert!(s.is_stale(1200));
        s.set_timestamp(500);
        assert!(!s.is_stale(1200));
        // Timestamps never regress.
        s.set_timestamp(100);
        assert_eq!(s.timestamp, 500);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_session() {
        let mut s = session();
        s.register_result(1, 6, Ok(10));
        s.publish(8, 7);
        s.commit_events(8);
        let snap = s.to_snapshot();
        let restored = TestSession::from_snapshot(snap);
        assert_eq!(restored.id, s.id);
        assert_eq!(restored.command_sequence, s.command_sequence);
        assert_eq!(restored.get_result(1).unwrap().result, Ok(10));
        assert_eq!(restored.pending_event_batches(), 1);
        assert_eq!(restored.event_index, 8);
    }
}
