//! Per-connection room membership bookkeeping.
//!
//! Tracks two things per conversation: whether a join is in flight or
//! established on the current link, and how many open sessions want the
//! membership (those are the rooms replayed after a reconnect).

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{ChatError, Result};

pub(crate) type JoinWaiter = oneshot::Sender<Result<()>>;

enum JoinState {
    Joining {
        attempt: u64,
        waiters: Vec<JoinWaiter>,
    },
    Joined,
}

/// What a caller of `join` has to do next.
pub(crate) enum JoinStep {
    /// Already joined on this link.
    Ready,
    /// A join is in flight; wait for its outcome.
    Wait(oneshot::Receiver<Result<()>>),
    /// Caller owns the request for `attempt` and must report back through
    /// [`RoomTable::finish_join`]. Its own outcome arrives on the receiver.
    Send(u64, oneshot::Receiver<Result<()>>),
}

#[derive(Default)]
pub(crate) struct RoomTable {
    states: HashMap<String, JoinState>,
    open: HashMap<String, usize>,
    next_attempt: u64,
}

impl RoomTable {
    pub fn begin_join(&mut self, conversation_id: &str) -> JoinStep {
        let (tx, rx) = oneshot::channel();
        match self.states.get_mut(conversation_id) {
            Some(JoinState::Joined) => JoinStep::Ready,
            Some(JoinState::Joining { waiters, .. }) => {
                waiters.push(tx);
                JoinStep::Wait(rx)
            }
            None => {
                let attempt = self.start(conversation_id, vec![tx]);
                JoinStep::Send(attempt, rx)
            }
        }
    }

    fn start(&mut self, conversation_id: &str, waiters: Vec<JoinWaiter>) -> u64 {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.states.insert(
            conversation_id.to_string(),
            JoinState::Joining { attempt, waiters },
        );
        attempt
    }

    /// Record the outcome of join `attempt`. Outcomes of superseded attempts
    /// (the link was lost, or the room was left meanwhile) are discarded.
    pub fn finish_join(&mut self, conversation_id: &str, attempt: u64, result: &Result<()>) {
        let current = matches!(
            self.states.get(conversation_id),
            Some(JoinState::Joining { attempt: a, .. }) if *a == attempt
        );
        if !current {
            return;
        }
        let Some(JoinState::Joining { waiters, .. }) = self.states.remove(conversation_id) else {
            return;
        };
        if result.is_ok() {
            self.states
                .insert(conversation_id.to_string(), JoinState::Joined);
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn is_joined(&self, conversation_id: &str) -> bool {
        matches!(self.states.get(conversation_id), Some(JoinState::Joined))
    }

    /// Forget membership for `conversation_id` entirely.
    pub fn leave(&mut self, conversation_id: &str) {
        self.open.remove(conversation_id);
        if let Some(JoinState::Joining { waiters, .. }) = self.states.remove(conversation_id) {
            for waiter in waiters {
                let _ = waiter.send(Err(ChatError::JoinRejected(
                    "conversation left before join completed".to_string(),
                )));
            }
        }
    }

    pub fn retain(&mut self, conversation_id: &str) {
        *self.open.entry(conversation_id.to_string()).or_insert(0) += 1;
    }

    /// Drop one session's claim. Returns true when it was the last one.
    pub fn release(&mut self, conversation_id: &str) -> bool {
        match self.open.get_mut(conversation_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.open.remove(conversation_id);
                true
            }
            None => false,
        }
    }

    /// The link is gone: nothing is joined anymore, in-flight joins fail.
    pub fn connection_lost(&mut self) {
        for (_, state) in self.states.drain() {
            if let JoinState::Joining { waiters, .. } = state {
                for waiter in waiters {
                    let _ = waiter.send(Err(ChatError::NotConnected));
                }
            }
        }
    }

    /// Deliberate disconnect: forget the link state and every open session's
    /// claim, so a later connect starts with no rooms to replay.
    pub fn reset(&mut self) {
        self.connection_lost();
        self.open.clear();
    }

    /// Mark every room with an open session as `Joining` on a fresh link and
    /// return the attempts the caller must send.
    pub fn prepare_rejoin(&mut self) -> Vec<(String, u64)> {
        let wanted: Vec<String> = self
            .open
            .keys()
            .filter(|id| !self.states.contains_key(*id))
            .cloned()
            .collect();
        wanted
            .into_iter()
            .map(|id| {
                let attempt = self.start(&id, Vec::new());
                (id, attempt)
            })
            .collect()
    }

    #[cfg(test)]
    pub fn open_rooms(&self) -> usize {
        self.open.len()
    }
}
