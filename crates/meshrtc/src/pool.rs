//! Connection pool
//!
//! Two indexes over the live connections: in-flight records keyed by
//! correlation ID, and established records keyed by sdp_id. A record sits in
//! the established index only while its transport is connected.

use crate::connection::ConnectionRecord;
use crate::types::CorrelationId;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct PoolState {
    in_flight: HashMap<CorrelationId, Arc<ConnectionRecord>>,
    established: HashMap<Uuid, Arc<ConnectionRecord>>,
    closed: bool,
}

/// Tracks every connection the mesh owns
#[derive(Default)]
pub struct ConnectionPool {
    state: RwLock<PoolState>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new record
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] once the pool has been drained.
    pub(crate) fn track(&self, record: &Arc<ConnectionRecord>) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        state
            .in_flight
            .insert(record.correlation_id(), Arc::clone(record));
        Ok(())
    }

    /// Move a connected record into the established index
    ///
    /// Returns false if the record has no sdp_id yet or the pool is closed.
    /// A previous entry for the same sdp_id is replaced.
    pub(crate) fn promote(&self, record: &Arc<ConnectionRecord>) -> bool {
        let Some(sdp_id) = record.sdp_id() else {
            return false;
        };

        let mut state = self.state.write();
        if state.closed {
            return false;
        }
        state.in_flight.remove(&record.correlation_id());
        if let Some(previous) = state.established.insert(sdp_id, Arc::clone(record)) {
            if !Arc::ptr_eq(&previous, record) {
                debug!(sdp_id = %sdp_id, "Replaced established connection");
            }
        }
        info!(
            sdp_id = %sdp_id,
            client_id = ?record.client_id(),
            established = state.established.len(),
            "Connection established"
        );
        true
    }

    /// Remove a record from both indexes
    ///
    /// Returns true if the record was established.
    pub(crate) fn evict(&self, record: &Arc<ConnectionRecord>) -> bool {
        let mut state = self.state.write();
        state.in_flight.remove(&record.correlation_id());

        let Some(sdp_id) = record.sdp_id() else {
            return false;
        };
        let owned = state
            .established
            .get(&sdp_id)
            .is_some_and(|current| Arc::ptr_eq(current, record));
        if owned {
            state.established.remove(&sdp_id);
        }
        owned
    }

    /// Close the pool and hand back every record it held
    pub(crate) fn drain(&self) -> Vec<Arc<ConnectionRecord>> {
        let mut state = self.state.write();
        state.closed = true;
        let mut records: Vec<_> = state.in_flight.drain().map(|(_, r)| r).collect();
        records.extend(state.established.drain().map(|(_, r)| r));
        records
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Established connection by sdp_id
    pub fn get(&self, sdp_id: &Uuid) -> Option<Arc<ConnectionRecord>> {
        self.state.read().established.get(sdp_id).cloned()
    }

    /// Snapshot of the established connections
    pub fn established(&self) -> Vec<Arc<ConnectionRecord>> {
        self.state.read().established.values().cloned().collect()
    }

    /// Remote clients of the established connections
    pub fn established_client_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .state
            .read()
            .established
            .values()
            .filter_map(|record| record.client_id())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Snapshot of every tracked record, in flight and established
    pub fn records(&self) -> Vec<Arc<ConnectionRecord>> {
        let state = self.state.read();
        state
            .in_flight
            .values()
            .chain(state.established.values())
            .cloned()
            .collect()
    }

    pub fn established_count(&self) -> usize {
        self.state.read().established.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.read().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockNetwork;
    use crate::types::Origin;

    fn record(network: &MockNetwork) -> Arc<ConnectionRecord> {
        let (transport, _events) = network.transport();
        ConnectionRecord::new(Origin::Initiator, transport)
    }

    #[test]
    fn test_promote_requires_sdp_id() {
        let network = MockNetwork::new();
        let pool = ConnectionPool::new();
        let record = record(&network);

        pool.track(&record).unwrap();
        assert!(!pool.promote(&record));
        assert_eq!(pool.in_flight_count(), 1);

        record.set_sdp_id(Uuid::new_v4());
        record.set_client_id(Uuid::new_v4());
        assert!(pool.promote(&record));
        assert_eq!(pool.in_flight_count(), 0);
        assert_eq!(pool.established_count(), 1);
        assert_eq!(pool.established_client_ids(), vec![record.client_id().unwrap()]);
    }

    #[test]
    fn test_evict_only_removes_own_entry() {
        let network = MockNetwork::new();
        let pool = ConnectionPool::new();
        let sdp_id = Uuid::new_v4();

        let old = record(&network);
        old.set_sdp_id(sdp_id);
        let new = record(&network);
        new.set_sdp_id(sdp_id);

        assert!(pool.promote(&old));
        assert!(pool.promote(&new));

        assert!(!pool.evict(&old));
        assert!(pool.get(&sdp_id).is_some());
        assert!(pool.evict(&new));
        assert!(pool.get(&sdp_id).is_none());
    }

    #[test]
    fn test_drain_closes_pool() {
        let network = MockNetwork::new();
        let pool = ConnectionPool::new();
        let a = record(&network);
        let b = record(&network);
        b.set_sdp_id(Uuid::new_v4());

        pool.track(&a).unwrap();
        pool.track(&b).unwrap();
        pool.promote(&b);

        assert_eq!(pool.records().len(), 2);

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_closed());
        assert!(matches!(
            pool.track(&record(&network)),
            Err(Error::ShuttingDown)
        ));
        assert!(!pool.promote(&b));
        assert_eq!(pool.established_count(), 0);
        assert!(pool.records().is_empty());
    }
}
