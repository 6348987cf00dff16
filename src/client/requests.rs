//! Correlate outbound requests with the responses that come back for them.
//!
//! Every read or confirmed write gets a fresh I/O id before it goes out, and
//! a completion handle parked in a table here. The circuit receive path
//! completes the handle when the matching response arrives; channel close
//! and circuit death sweep the table so nothing waits forever.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    client::circuit::CircuitKey,
    dbr::Dbr,
    messages::ErrorCondition,
    utils::wrapping_inplace_add,
};

/// What kind of operation a pending request represents
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RequestKind {
    ReadNotify,
    WriteNotify,
}

/// The successful half of a request completion
#[derive(Debug)]
pub(crate) enum RequestResult {
    /// Deserialized data, for reads
    Value(Dbr),
    /// Confirmation only, for writes
    WriteOk,
}

/// A failed request: the CA status plus a human-oriented message
#[derive(Debug, Clone)]
pub(crate) struct RequestFailure {
    pub condition: ErrorCondition,
    pub message: String,
}

impl RequestFailure {
    pub(crate) fn from_condition(condition: ErrorCondition) -> Self {
        RequestFailure {
            message: condition.message().to_string(),
            condition,
        }
    }
}

pub(crate) type Completion = oneshot::Sender<Result<RequestResult, RequestFailure>>;
pub(crate) type CompletionWaiter = oneshot::Receiver<Result<RequestResult, RequestFailure>>;

struct PendingRequest {
    kind: RequestKind,
    cid: u32,
    circuit: CircuitKey,
    completion: Completion,
    #[allow(dead_code)]
    created: Instant,
}

#[derive(Default)]
struct MuxState {
    next_ioid: u32,
    pending: HashMap<u32, PendingRequest>,
}

/// The I/O request multiplexer: hands out ids, parks completions, and
/// routes responses back by id.
#[derive(Default)]
pub(crate) struct IoMux {
    state: Mutex<MuxState>,
}

impl IoMux {
    /// Allocate a fresh I/O id and park a completion handle under it.
    ///
    /// Ids are monotonic and wrap; occupied slots are skipped so an id is
    /// never reused while its request is still outstanding.
    pub(crate) fn register(
        &self,
        kind: RequestKind,
        cid: u32,
        circuit: CircuitKey,
    ) -> (u32, CompletionWaiter) {
        let (completion, waiter) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let ioid = loop {
            let candidate = wrapping_inplace_add(&mut state.next_ioid);
            if !state.pending.contains_key(&candidate) {
                break candidate;
            }
        };
        state.pending.insert(
            ioid,
            PendingRequest {
                kind,
                cid,
                circuit,
                completion,
                created: Instant::now(),
            },
        );
        (ioid, waiter)
    }

    /// Allocate an id from the shared I/O-id space without parking a
    /// completion, for subscriptions
    pub(crate) fn allocate_id(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        loop {
            let candidate = wrapping_inplace_add(&mut state.next_ioid);
            if !state.pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Route a response to the request that asked for it.
    ///
    /// Responses with an id nothing is waiting on are logged and dropped.
    pub(crate) fn complete(&self, ioid: u32, result: Result<RequestResult, RequestFailure>) {
        let Some(request) = self.state.lock().unwrap().pending.remove(&ioid) else {
            warn!("Discarding response for unknown I/O id {ioid}");
            return;
        };
        // The waiter may have been dropped by a caller-side timeout
        let _ = request.completion.send(result);
    }

    /// Look up the kind registered under an id, for response validation
    pub(crate) fn kind_of(&self, ioid: u32) -> Option<RequestKind> {
        self.state
            .lock()
            .unwrap()
            .pending
            .get(&ioid)
            .map(|r| r.kind)
    }

    /// Drop a request without completing it (caller cancelled)
    pub(crate) fn cancel(&self, ioid: u32) {
        self.state.lock().unwrap().pending.remove(&ioid);
    }

    /// Fail every request outstanding against one channel
    pub(crate) fn fail_channel(&self, cid: u32, condition: ErrorCondition) {
        self.fail_matching(|r| r.cid == cid, condition);
    }

    /// Fail every request outstanding against one circuit
    pub(crate) fn fail_circuit(&self, circuit: CircuitKey, condition: ErrorCondition) {
        self.fail_matching(|r| r.circuit == circuit, condition);
    }

    fn fail_matching<F: Fn(&PendingRequest) -> bool>(&self, select: F, condition: ErrorCondition) {
        let failed: Vec<PendingRequest> = {
            let mut state = self.state.lock().unwrap();
            let ids: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, r)| select(r))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id))
                .collect()
        };
        if !failed.is_empty() {
            debug!(
                "Failing {} outstanding requests with {condition:?}",
                failed.len()
            );
        }
        for request in failed {
            let _ = request
                .completion
                .send(Err(RequestFailure::from_condition(condition)));
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn test_key() -> CircuitKey {
        (
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 5064),
            0,
        )
    }

    #[tokio::test]
    async fn complete_read() {
        let mux = IoMux::default();
        let (ioid, waiter) = mux.register(RequestKind::ReadNotify, 1, test_key());
        assert_eq!(mux.kind_of(ioid), Some(RequestKind::ReadNotify));

        mux.complete(
            ioid,
            Ok(RequestResult::Value(Dbr::Basic(vec![5i32].into()))),
        );
        let Ok(Ok(RequestResult::Value(dbr))) = waiter.await else {
            panic!("request did not complete with a value");
        };
        assert_eq!(dbr.value(), &crate::dbr::DbrValue::Long(vec![5]));
        assert_eq!(mux.outstanding(), 0);
    }

    #[tokio::test]
    async fn ids_are_unique_while_occupied() {
        let mux = IoMux::default();
        let (a, _wa) = mux.register(RequestKind::ReadNotify, 1, test_key());
        let (b, _wb) = mux.register(RequestKind::WriteNotify, 1, test_key());
        assert_ne!(a, b);

        // Force the counter to wrap onto the occupied slots
        mux.state.lock().unwrap().next_ioid = a;
        let (c, _wc) = mux.register(RequestKind::ReadNotify, 2, test_key());
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[tokio::test]
    async fn channel_failure_sweeps_only_that_channel() {
        let mux = IoMux::default();
        let (_a, wa) = mux.register(RequestKind::ReadNotify, 1, test_key());
        let (_b, wb) = mux.register(RequestKind::WriteNotify, 2, test_key());

        mux.fail_channel(1, ErrorCondition::ChanDestroy);
        let Ok(Err(failure)) = wa.await else {
            panic!("channel 1 request should have failed");
        };
        assert_eq!(failure.condition, ErrorCondition::ChanDestroy);
        assert_eq!(mux.outstanding(), 1);
        drop(wb);
    }

    #[tokio::test]
    async fn circuit_failure_sweeps_everything_on_it() {
        let mux = IoMux::default();
        let (_a, wa) = mux.register(RequestKind::ReadNotify, 1, test_key());
        let (_b, wb) = mux.register(RequestKind::ReadNotify, 2, test_key());

        mux.fail_circuit(test_key(), ErrorCondition::Disconn);
        assert_eq!(wa.await.unwrap().unwrap_err().condition, ErrorCondition::Disconn);
        assert_eq!(wb.await.unwrap().unwrap_err().condition, ErrorCondition::Disconn);
        assert_eq!(mux.outstanding(), 0);
    }

    #[tokio::test]
    async fn unknown_response_is_dropped() {
        let mux = IoMux::default();
        // Just must not panic
        mux.complete(999, Ok(RequestResult::WriteOk));
    }
}
