//! What the tracer sees of the host execution environment.
//!
//! The interpreter itself lives outside of this crate; it hands over each
//! transaction as a stream of [`ExecutionEvent`]s and exposes the account
//! state through [`WorldState`].

use ethereum_types::{H160, H256, U256};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Identifier of an execution context (call frame) within a transaction.
pub type FrameId = usize;

/// A single observable step of the host execution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
    /// An opcode ran in `frame`, whose parent is `parent` (equal to `frame`
    /// for the root context).
    Opcode {
        frame: FrameId,
        parent: FrameId,
        opcode: u8,
        stack_inputs: Vec<U256>,
    },
    /// A new context `frame` was entered from `parent`.
    ContextEnter { frame: FrameId, parent: FrameId },
    /// The context `frame` returned, possibly reverting.
    ContextExit { frame: FrameId, reverted: bool },
}

impl ExecutionEvent {
    /// The context the event happened in.
    pub const fn frame(&self) -> FrameId {
        match self {
            ExecutionEvent::Opcode { frame, .. }
            | ExecutionEvent::ContextEnter { frame, .. }
            | ExecutionEvent::ContextExit { frame, .. } => *frame,
        }
    }
}

/// A candidate transaction, together with the events its execution produced.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: H256,
    pub sender: H160,
    pub recipient: Option<H160>,
    pub value: U256,
    pub events: Vec<ExecutionEvent>,
}

impl Transaction {
    pub fn new(hash: H256, sender: H160, recipient: Option<H160>) -> Self {
        Self {
            hash,
            sender,
            recipient,
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = ExecutionEvent>) -> Self {
        self.events.extend(events);
        self
    }

    /// Number of opcodes executed by the transaction.
    pub fn opcode_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::Opcode { .. }))
            .count()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Change {
    Balance(H160, Option<U256>),
    Nonce(H160, Option<u64>),
}

/// A minimal read/write view of account balances and nonces.
///
/// While a journal is open, every write records the value it replaced, so
/// that the writes can be undone in O(writes) rather than by copying the whole
/// state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorldState {
    balances: HashMap<H160, U256>,
    nonces: HashMap<H160, u64>,
    journal: Option<Vec<Change>>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, account: &H160) -> U256 {
        self.balances.get(account).copied().unwrap_or_default()
    }

    pub fn set_balance(&mut self, account: H160, balance: U256) {
        let previous = self.balances.insert(account, balance);
        self.record(Change::Balance(account, previous));
    }

    pub fn nonce(&self, account: &H160) -> u64 {
        self.nonces.get(account).copied().unwrap_or_default()
    }

    pub fn increment_nonce(&mut self, account: H160) {
        let previous = self.nonces.get(&account).copied();
        self.nonces
            .insert(account, previous.unwrap_or_default().saturating_add(1));
        self.record(Change::Nonce(account, previous));
    }

    /// Moves `value` from `from` to `to`. Returns `false` and leaves the state
    /// untouched if `from` cannot afford it.
    pub fn transfer(&mut self, from: H160, to: H160, value: U256) -> bool {
        let Some(remaining) = self.balance(&from).checked_sub(value) else {
            return false;
        };
        self.set_balance(from, remaining);
        let credited = self.balance(&to).saturating_add(value);
        self.set_balance(to, credited);
        true
    }

    fn record(&mut self, change: Change) {
        if let Some(journal) = &mut self.journal {
            journal.push(change);
        }
    }

    /// Starts recording writes. An already open journal is discarded, keeping
    /// its writes.
    pub fn open_journal(&mut self) {
        self.journal = Some(vec![]);
    }

    pub fn is_journaling(&self) -> bool {
        self.journal.is_some()
    }

    /// Keeps every write made since [`WorldState::open_journal`] and stops
    /// recording.
    pub fn commit_journal(&mut self) {
        self.journal = None;
    }

    /// Undoes every write made since [`WorldState::open_journal`], newest
    /// first, and stops recording.
    pub fn revert_journal(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for change in journal.into_iter().rev() {
            match change {
                Change::Balance(account, Some(balance)) => {
                    self.balances.insert(account, balance);
                }
                Change::Balance(account, None) => {
                    self.balances.remove(&account);
                }
                Change::Nonce(account, Some(nonce)) => {
                    self.nonces.insert(account, nonce);
                }
                Change::Nonce(account, None) => {
                    self.nonces.remove(&account);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_requires_funds() {
        let (alice, bob) = (H160::repeat_byte(1), H160::repeat_byte(2));
        let mut world = WorldState::new();
        world.set_balance(alice, 10.into());

        assert!(world.transfer(alice, bob, 4.into()));
        assert_eq!(world.balance(&alice), 6.into());
        assert_eq!(world.balance(&bob), 4.into());

        assert!(!world.transfer(bob, alice, 5.into()));
        assert_eq!(world.balance(&bob), 4.into());
    }

    #[test]
    fn self_transfer_keeps_balance() {
        let alice = H160::repeat_byte(1);
        let mut world = WorldState::new();
        world.set_balance(alice, 10.into());
        assert!(world.transfer(alice, alice, 3.into()));
        assert_eq!(world.balance(&alice), 10.into());
    }

    #[test]
    fn reverted_journal_restores_touched_accounts() {
        let (alice, bob, carol) = (
            H160::repeat_byte(1),
            H160::repeat_byte(2),
            H160::repeat_byte(3),
        );
        let mut world = WorldState::new();
        world.set_balance(alice, 10.into());
        world.increment_nonce(alice);
        let before = world.clone();

        world.open_journal();
        assert!(world.transfer(alice, bob, 4.into()));
        world.increment_nonce(alice);
        world.increment_nonce(carol);
        world.set_balance(alice, 1.into());
        world.revert_journal();

        assert_eq!(world, before);
        assert!(!world.is_journaling());
        assert_eq!(world.nonce(&carol), 0);
    }

    #[test]
    fn committed_journal_keeps_writes() {
        let (alice, bob) = (H160::repeat_byte(1), H160::repeat_byte(2));
        let mut world = WorldState::new();
        world.set_balance(alice, 10.into());

        world.open_journal();
        assert!(world.transfer(alice, bob, 4.into()));
        world.commit_journal();
        world.revert_journal();

        assert_eq!(world.balance(&alice), 6.into());
        assert_eq!(world.balance(&bob), 4.into());
    }

    #[test]
    fn counts_opcodes_only() {
        let tx = Transaction::new(H256::zero(), H160::zero(), None).with_events([
            ExecutionEvent::Opcode {
                frame: 0,
                parent: 0,
                opcode: 0x01,
                stack_inputs: vec![1.into(), 2.into()],
            },
            ExecutionEvent::ContextEnter {
                frame: 1,
                parent: 0,
            },
            ExecutionEvent::ContextExit {
                frame: 1,
                reverted: false,
            },
        ]);
        assert_eq!(tx.opcode_count(), 1);
        assert_eq!(tx.events[1].frame(), 1);
    }
}
