//! Per-room function table and in-flight call correlation.

use std::collections::HashMap;

use dashmap::DashMap;
use rand::Rng;
use roomwire_core::protocol::RpcOutcome;
use roomwire_core::{CallId, ConnectionId, InvokePolicy, RpcError};
use tokio::sync::oneshot;

/// One registration of a function by a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackHandle {
    pub owner: ConnectionId,
    pub name: String,
}

/// A registered function name with its policy and ordered callbacks.
#[derive(Clone, Debug)]
pub struct RpcEntry {
    pub name: String,
    pub policy: InvokePolicy,
    /// Registration order; `first` picks the head, `last` the tail.
    pub callbacks: Vec<CallbackHandle>,
}

/// Function registry of one room.
#[derive(Debug, Default)]
pub struct RpcTable {
    entries: HashMap<String, RpcEntry>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `owner` as a callback for `name`.
    ///
    /// Checks run in order: policy conflict with an existing entry, then
    /// occupancy of a `single` entry (even by the same owner). Under a
    /// multi-callback policy an owner's earlier callback is replaced, moving
    /// it to the tail.
    pub fn register(
        &mut self,
        name: &str,
        policy: InvokePolicy,
        owner: &ConnectionId,
    ) -> Result<(), RpcError> {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| RpcEntry {
                name: name.to_string(),
                policy,
                callbacks: Vec::new(),
            });

        if entry.policy != policy {
            return Err(RpcError::PolicyConflict {
                name: name.to_string(),
                existing: entry.policy,
                requested: policy,
            });
        }
        if !policy.allows_many() && !entry.callbacks.is_empty() {
            return Err(RpcError::AlreadyRegistered {
                name: name.to_string(),
            });
        }

        entry.callbacks.retain(|cb| &cb.owner != owner);
        entry.callbacks.push(CallbackHandle {
            owner: owner.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// Remove `owner`'s callback for `name`. Returns whether one was removed.
    pub fn unregister(&mut self, name: &str, owner: &ConnectionId) -> bool {
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };
        let before = entry.callbacks.len();
        entry.callbacks.retain(|cb| &cb.owner != owner);
        let removed = entry.callbacks.len() != before;
        if entry.callbacks.is_empty() {
            self.entries.remove(name);
        }
        removed
    }

    /// Remove every callback owned by `owner`. Returns the affected names.
    pub fn remove_owner(&mut self, owner: &ConnectionId) -> Vec<String> {
        let mut affected = Vec::new();
        self.entries.retain(|name, entry| {
            let before = entry.callbacks.len();
            entry.callbacks.retain(|cb| &cb.owner != owner);
            if entry.callbacks.len() != before {
                affected.push(name.clone());
            }
            !entry.callbacks.is_empty()
        });
        affected
    }

    pub fn select(&self, name: &str) -> Result<CallbackHandle, RpcError> {
        self.select_with(name, &mut rand::thread_rng())
    }

    /// Pick the callback to invoke according to the entry's policy.
    pub fn select_with<R: Rng>(
        &self,
        name: &str,
        rng: &mut R,
    ) -> Result<CallbackHandle, RpcError> {
        let entry = self
            .entries
            .get(name)
            .filter(|e| !e.callbacks.is_empty())
            .ok_or_else(|| RpcError::not_registered(name))?;

        let idx = match entry.policy {
            InvokePolicy::Single | InvokePolicy::First => 0,
            InvokePolicy::Last => entry.callbacks.len() - 1,
            InvokePolicy::Random => rng.gen_range(0..entry.callbacks.len()),
        };
        Ok(entry.callbacks[idx].clone())
    }

    /// Delete `name` with all of its callbacks.
    pub fn remove_entry(&mut self, name: &str) -> Option<RpcEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RpcEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct PendingCall {
    callee: ConnectionId,
    room: String,
    function: String,
    tx: oneshot::Sender<RpcOutcome>,
}

/// Calls relayed to a callee and awaiting its `_result` event.
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<CallId, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        call_id: CallId,
        callee: ConnectionId,
        room: &str,
        function: &str,
    ) -> oneshot::Receiver<RpcOutcome> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            call_id,
            PendingCall {
                callee,
                room: room.to_string(),
                function: function.to_string(),
                tx,
            },
        );
        rx
    }

    /// Deliver a result. Only the connection the call was relayed to may
    /// resolve it; anything else leaves the call pending.
    pub fn resolve(
        &self,
        call_id: &CallId,
        sender: &ConnectionId,
        room: &str,
        outcome: RpcOutcome,
    ) -> bool {
        match self
            .calls
            .remove_if(call_id, |_, p| &p.callee == sender && p.room == room)
        {
            Some((_, pending)) => {
                let _ = pending.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forget a call without delivering anything.
    pub fn cancel(&self, call_id: &CallId) {
        self.calls.remove(call_id);
    }

    /// Fail every call relayed to `callee`. Returns the failed call ids.
    pub fn drop_callee(&self, callee: &ConnectionId) -> Vec<CallId> {
        self.drop_where(|p| &p.callee == callee)
    }

    /// Fail the calls relayed to `callee` within `room`.
    pub fn drop_callee_in(&self, callee: &ConnectionId, room: &str) -> Vec<CallId> {
        self.drop_where(|p| &p.callee == callee && p.room == room)
    }

    fn drop_where(&self, pred: impl Fn(&PendingCall) -> bool) -> Vec<CallId> {
        let ids: Vec<CallId> = self
            .calls
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            if let Some((_, pending)) = self.calls.remove(id) {
                let err = RpcError::CalleeDisconnected {
                    name: pending.function,
                };
                let _ = pending.tx.send(RpcOutcome::Err(err.to_string()));
            }
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn conn(name: &str) -> ConnectionId {
        thread_local! {
            static IDS: RefCell<HashMap<String, ConnectionId>> = RefCell::default();
        }
        IDS.with(|ids| {
            ids.borrow_mut()
                .entry(name.to_string())
                .or_insert_with(ConnectionId::next)
                .clone()
        })
    }

    #[test]
    fn single_accepts_one_owner() {
        let mut table = RpcTable::new();
        table.register("f", InvokePolicy::Single, &conn("a")).unwrap();

        let err = table.register("f", InvokePolicy::Single, &conn("b")).unwrap_err();
        assert_eq!(err.to_string(), "Function f is already registered");

        // Same owner re-registering a single is also occupied.
        let err = table.register("f", InvokePolicy::Single, &conn("a")).unwrap_err();
        assert!(matches!(err, RpcError::AlreadyRegistered { .. }));
    }

    #[test]
    fn policy_conflict_checked_first() {
        let mut table = RpcTable::new();
        table.register("f", InvokePolicy::Single, &conn("a")).unwrap();
        let err = table.register("f", InvokePolicy::First, &conn("b")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Function f is registered with invoke policy single, not first"
        );
    }

    #[test]
    fn first_and_last_follow_registration_order() {
        let mut table = RpcTable::new();
        for owner in ["a", "b", "c"] {
            table.register("first", InvokePolicy::First, &conn(owner)).unwrap();
            table.register("last", InvokePolicy::Last, &conn(owner)).unwrap();
        }
        assert_eq!(table.select("first").unwrap().owner, conn("a"));
        assert_eq!(table.select("last").unwrap().owner, conn("c"));
    }

    #[test]
    fn reregister_moves_owner_to_tail() {
        let mut table = RpcTable::new();
        table.register("f", InvokePolicy::Last, &conn("a")).unwrap();
        table.register("f", InvokePolicy::Last, &conn("b")).unwrap();
        table.register("f", InvokePolicy::Last, &conn("a")).unwrap();

        let entry = table.get("f").unwrap();
        assert_eq!(entry.callbacks.len(), 2);
        assert_eq!(table.select("f").unwrap().owner, conn("a"));
    }

    #[test]
    fn random_stays_within_candidates() {
        let mut table = RpcTable::new();
        for owner in ["a", "b", "c"] {
            table.register("r", InvokePolicy::Random, &conn(owner)).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let pick = table.select_with("r", &mut rng).unwrap();
            assert!([conn("a"), conn("b"), conn("c")].contains(&pick.owner));
            seen.insert(pick.owner);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn select_unknown_is_not_registered() {
        let table = RpcTable::new();
        let err = table.select("testrpc").unwrap_err();
        assert_eq!(err.to_string(), "Function testrpc is not registered");
    }

    #[test]
    fn unregister_deletes_empty_entry() {
        let mut table = RpcTable::new();
        table.register("f", InvokePolicy::First, &conn("a")).unwrap();
        table.register("f", InvokePolicy::First, &conn("b")).unwrap();

        assert!(table.unregister("f", &conn("a")));
        assert_eq!(table.select("f").unwrap().owner, conn("b"));
        assert!(!table.unregister("f", &conn("a")));

        assert!(table.unregister("f", &conn("b")));
        assert!(table.get("f").is_none());
        assert!(table.is_empty());

        // Once empty, a different policy is accepted.
        table.register("f", InvokePolicy::Single, &conn("c")).unwrap();
    }

    #[test]
    fn remove_owner_strips_all_callbacks() {
        let mut table = RpcTable::new();
        table.register("f", InvokePolicy::Single, &conn("a")).unwrap();
        table.register("g", InvokePolicy::First, &conn("a")).unwrap();
        table.register("g", InvokePolicy::First, &conn("b")).unwrap();

        let mut affected = table.remove_owner(&conn("a"));
        affected.sort();
        assert_eq!(affected, vec!["f".to_string(), "g".to_string()]);
        assert!(table.get("f").is_none());
        assert_eq!(table.select("g").unwrap().owner, conn("b"));
    }

    #[tokio::test]
    async fn pending_resolves_for_callee_only() {
        let pending = PendingCalls::new();
        let id = CallId::generate();
        let rx = pending.insert(id.clone(), conn("callee"), "room", "f");

        assert!(!pending.resolve(&id, &conn("intruder"), "room", RpcOutcome::Ok(json!(1))));
        assert!(!pending.resolve(&id, &conn("callee"), "other", RpcOutcome::Ok(json!(1))));
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(&id, &conn("callee"), "room", RpcOutcome::Ok(json!(2))));
        assert_eq!(rx.await.unwrap(), RpcOutcome::Ok(json!(2)));
        assert!(pending.is_empty());

        // A second result for the same id is ignored.
        assert!(!pending.resolve(&id, &conn("callee"), "room", RpcOutcome::Ok(json!(3))));
    }

    #[tokio::test]
    async fn drop_callee_fails_calls() {
        let pending = PendingCalls::new();
        let rx1 = pending.insert(CallId::generate(), conn("a"), "room", "f");
        let rx2 = pending.insert(CallId::generate(), conn("b"), "room", "g");

        let dropped = pending.drop_callee(&conn("a"));
        assert_eq!(dropped.len(), 1);
        assert_eq!(
            rx1.await.unwrap(),
            RpcOutcome::Err("Function f owner disconnected".into())
        );
        assert_eq!(pending.len(), 1);

        pending.drop_callee_in(&conn("b"), "elsewhere");
        assert_eq!(pending.len(), 1);
        pending.drop_callee_in(&conn("b"), "room");
        assert!(rx2.await.unwrap().into_result().is_err());
    }

    #[tokio::test]
    async fn cancel_closes_receiver() {
        let pending = PendingCalls::new();
        let id = CallId::generate();
        let rx = pending.insert(id.clone(), conn("a"), "room", "f");
        pending.cancel(&id);
        assert!(rx.await.is_err());
    }
}
