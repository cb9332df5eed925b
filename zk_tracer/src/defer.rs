//! Work that must wait until a later point of the execution.
//!
//! Some facts needed in a row are not known when the row is conceptually
//! produced: the balance of an account once the current opcode completed, or
//! the final position of a piece of code once the whole block is known. Such
//! work is scheduled here as a [`DeferredAction`] tagged with the
//! [`Checkpoint`] at which it must run, and fired by the sequencer when that
//! checkpoint is reached.
//!
//! Each queue is FIFO and every action fires at most once. An action receives
//! the registry itself and may schedule more work; anything it schedules is
//! picked up by the *next* checkpoint of that kind, never by the one currently
//! firing.
//!
//! End-of-opcode, next-context and end-of-transaction work never outlives the
//! transaction that scheduled it. The transaction-scoped queues are therefore
//! empty whenever a transaction starts, and discarding a transaction restores
//! them exactly.

use std::fmt;
use std::mem;

use crate::error::{TraceError, TraceResult};
use crate::host::FrameId;

/// A unit of deferred work over a context of type `C`.
pub type Action<C> = Box<dyn FnOnce(&mut C, &mut DeferRegistry<C>) -> TraceResult<()>>;

/// Points of the execution at which deferred work is guaranteed to run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Checkpoint {
    EndOfOpcode,
    NextContext,
    EndOfTransaction,
    EndOfBlock,
}

/// A scheduled action together with the checkpoint it targets.
pub enum DeferredAction<C> {
    /// Runs once the current opcode completed.
    EndOfOpcode(Action<C>),
    /// Runs upon entry into a context whose parent is `target_frame`.
    NextContext {
        target_frame: FrameId,
        action: Action<C>,
    },
    /// Runs once the current transaction completed.
    EndOfTransaction(Action<C>),
    /// Runs once the whole block was processed.
    EndOfBlock(Action<C>),
}

impl<C> DeferredAction<C> {
    pub const fn checkpoint(&self) -> Checkpoint {
        match self {
            DeferredAction::EndOfOpcode(_) => Checkpoint::EndOfOpcode,
            DeferredAction::NextContext { .. } => Checkpoint::NextContext,
            DeferredAction::EndOfTransaction(_) => Checkpoint::EndOfTransaction,
            DeferredAction::EndOfBlock(_) => Checkpoint::EndOfBlock,
        }
    }
}

impl<C> fmt::Debug for DeferredAction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredAction::NextContext { target_frame, .. } => f
                .debug_struct("NextContext")
                .field("target_frame", target_frame)
                .finish_non_exhaustive(),
            other => write!(f, "{:?}(..)", other.checkpoint()),
        }
    }
}

/// State of the registry at the start of a transaction; see
/// [`DeferRegistry::rollback`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeferCheckpoint {
    end_of_block_len: usize,
}

/// Four ordered queues of deferred actions, one per [`Checkpoint`].
pub struct DeferRegistry<C> {
    end_of_opcode: Vec<Action<C>>,
    next_context: Vec<(FrameId, Action<C>)>,
    end_of_transaction: Vec<Action<C>>,
    end_of_block: Vec<Action<C>>,
}

impl<C> DeferRegistry<C> {
    pub const fn new() -> Self {
        Self {
            end_of_opcode: vec![],
            next_context: vec![],
            end_of_transaction: vec![],
            end_of_block: vec![],
        }
    }

    /// Queues `deferred` behind every action already targeting the same
    /// checkpoint.
    pub fn schedule(&mut self, deferred: DeferredAction<C>) {
        match deferred {
            DeferredAction::EndOfOpcode(action) => self.end_of_opcode.push(action),
            DeferredAction::NextContext {
                target_frame,
                action,
            } => self.next_context.push((target_frame, action)),
            DeferredAction::EndOfTransaction(action) => self.end_of_transaction.push(action),
            DeferredAction::EndOfBlock(action) => self.end_of_block.push(action),
        }
    }

    pub fn on_end_of_opcode<F>(&mut self, action: F)
    where
        F: FnOnce(&mut C, &mut DeferRegistry<C>) -> TraceResult<()> + 'static,
    {
        self.schedule(DeferredAction::EndOfOpcode(Box::new(action)));
    }

    pub fn on_next_context<F>(&mut self, target_frame: FrameId, action: F)
    where
        F: FnOnce(&mut C, &mut DeferRegistry<C>) -> TraceResult<()> + 'static,
    {
        self.schedule(DeferredAction::NextContext {
            target_frame,
            action: Box::new(action),
        });
    }

    pub fn on_end_of_transaction<F>(&mut self, action: F)
    where
        F: FnOnce(&mut C, &mut DeferRegistry<C>) -> TraceResult<()> + 'static,
    {
        self.schedule(DeferredAction::EndOfTransaction(Box::new(action)));
    }

    pub fn on_end_of_block<F>(&mut self, action: F)
    where
        F: FnOnce(&mut C, &mut DeferRegistry<C>) -> TraceResult<()> + 'static,
    {
        self.schedule(DeferredAction::EndOfBlock(Box::new(action)));
    }

    /// Runs `actions` in order. On failure the remaining actions are dropped
    /// without running.
    fn run(&mut self, ctx: &mut C, actions: Vec<Action<C>>) -> TraceResult<()> {
        for action in actions {
            action(ctx, self)?;
        }
        Ok(())
    }

    /// Runs and clears the end-of-opcode queue.
    pub fn fire_end_of_opcode(&mut self, ctx: &mut C) -> TraceResult<()> {
        let actions = mem::take(&mut self.end_of_opcode);
        self.run(ctx, actions)
    }

    /// Runs the next-context actions targeting `parent_frame`, the parent of
    /// the context being entered. Actions targeting other frames stay queued
    /// in their original order.
    pub fn fire_next_context(&mut self, ctx: &mut C, parent_frame: FrameId) -> TraceResult<()> {
        let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut self.next_context)
            .into_iter()
            .partition(|(target, _)| *target == parent_frame);
        self.next_context = waiting;
        self.run(ctx, ready.into_iter().map(|(_, action)| action).collect())
    }

    /// Runs and clears the end-of-transaction queue.
    pub fn fire_end_of_transaction(&mut self, ctx: &mut C) -> TraceResult<()> {
        let actions = mem::take(&mut self.end_of_transaction);
        self.run(ctx, actions)
    }

    /// Runs and clears the end-of-block queue.
    pub fn fire_end_of_block(&mut self, ctx: &mut C) -> TraceResult<()> {
        let actions = mem::take(&mut self.end_of_block);
        self.run(ctx, actions)
    }

    /// Drops the transaction-scoped actions still queued once a transaction is
    /// over: the frames they target no longer exist, and no later transaction
    /// may inherit them. Returns the number of dropped actions.
    pub fn clear_transaction_scope(&mut self) -> usize {
        let dropped =
            self.end_of_opcode.len() + self.next_context.len() + self.end_of_transaction.len();
        self.end_of_opcode.clear();
        self.next_context.clear();
        self.end_of_transaction.clear();
        dropped
    }

    /// Fails if any transaction-scoped action is queued.
    pub fn ensure_no_transaction_scope(&self) -> TraceResult<()> {
        [
            Checkpoint::EndOfOpcode,
            Checkpoint::NextContext,
            Checkpoint::EndOfTransaction,
        ]
        .into_iter()
        .map(|checkpoint| (checkpoint, self.pending(checkpoint)))
        .find(|&(_, pending)| pending > 0)
        .map_or(Ok(()), |(checkpoint, pending)| {
            Err(TraceError::DeferredOutsideTransaction {
                checkpoint,
                pending,
            })
        })
    }

    /// Marks the start of a transaction. Fails if transaction-scoped work was
    /// left over, since a discarded transaction could not give it back.
    pub fn checkpoint(&self) -> TraceResult<DeferCheckpoint> {
        self.ensure_no_transaction_scope()?;
        Ok(DeferCheckpoint {
            end_of_block_len: self.end_of_block.len(),
        })
    }

    /// Drops every action scheduled since `checkpoint` was taken, without
    /// running it.
    pub fn rollback(&mut self, checkpoint: DeferCheckpoint) {
        self.clear_transaction_scope();
        self.end_of_block.truncate(checkpoint.end_of_block_len);
    }

    /// Drops every queued action without running it.
    pub fn clear_all(&mut self) {
        self.end_of_opcode.clear();
        self.next_context.clear();
        self.end_of_transaction.clear();
        self.end_of_block.clear();
    }

    /// Number of actions waiting for `checkpoint`.
    pub fn pending(&self, checkpoint: Checkpoint) -> usize {
        match checkpoint {
            Checkpoint::EndOfOpcode => self.end_of_opcode.len(),
            Checkpoint::NextContext => self.next_context.len(),
            Checkpoint::EndOfTransaction => self.end_of_transaction.len(),
            Checkpoint::EndOfBlock => self.end_of_block.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end_of_opcode.is_empty()
            && self.next_context.is_empty()
            && self.end_of_transaction.is_empty()
            && self.end_of_block.is_empty()
    }
}

impl<C> Default for DeferRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for DeferRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferRegistry")
            .field("end_of_opcode", &self.end_of_opcode.len())
            .field(
                "next_context",
                &self.next_context.iter().map(|(t, _)| t).collect::<Vec<_>>(),
            )
            .field("end_of_transaction", &self.end_of_transaction.len())
            .field("end_of_block", &self.end_of_block.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Vec<&'static str>;

    #[test]
    fn end_of_transaction_fires_once_in_order() -> TraceResult<()> {
        let mut registry = DeferRegistry::<Log>::new();
        registry.on_end_of_transaction(|log, _| {
            log.push("first");
            Ok(())
        });
        registry.on_end_of_transaction(|log, _| {
            log.push("second");
            Ok(())
        });
        registry.on_end_of_transaction(|log, _| {
            log.push("third");
            Ok(())
        });

        let mut log = Log::new();
        registry.fire_end_of_transaction(&mut log)?;
        assert_eq!(log, vec!["first", "second", "third"]);
        assert_eq!(registry.pending(Checkpoint::EndOfTransaction), 0);

        registry.fire_end_of_transaction(&mut log)?;
        assert_eq!(log.len(), 3);
        Ok(())
    }

    #[test]
    fn next_context_fires_only_for_matching_parent() -> TraceResult<()> {
        let mut registry = DeferRegistry::<Log>::new();
        registry.on_next_context(1, |log, _| {
            log.push("child of 1");
            Ok(())
        });
        registry.on_next_context(2, |log, _| {
            log.push("child of 2");
            Ok(())
        });
        registry.on_next_context(1, |log, _| {
            log.push("child of 1, again");
            Ok(())
        });

        let mut log = Log::new();
        registry.fire_next_context(&mut log, 2)?;
        assert_eq!(log, vec!["child of 2"]);
        assert_eq!(registry.pending(Checkpoint::NextContext), 2);

        registry.fire_next_context(&mut log, 3)?;
        assert_eq!(log.len(), 1);

        registry.fire_next_context(&mut log, 1)?;
        assert_eq!(log, vec!["child of 2", "child of 1", "child of 1, again"]);
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn reentrant_scheduling_waits_for_next_checkpoint() -> TraceResult<()> {
        let mut registry = DeferRegistry::<Log>::new();
        registry.on_end_of_opcode(|log, registry| {
            log.push("outer");
            registry.on_end_of_opcode(|log, _| {
                log.push("inner");
                Ok(())
            });
            Ok(())
        });

        let mut log = Log::new();
        registry.fire_end_of_opcode(&mut log)?;
        assert_eq!(log, vec!["outer"]);
        assert_eq!(registry.pending(Checkpoint::EndOfOpcode), 1);

        registry.fire_end_of_opcode(&mut log)?;
        assert_eq!(log, vec!["outer", "inner"]);
        Ok(())
    }

    #[test]
    fn reentrant_next_context_for_same_parent_is_not_refired() -> TraceResult<()> {
        let mut registry = DeferRegistry::<Log>::new();
        registry.on_next_context(7, |log, registry| {
            log.push("a");
            registry.on_next_context(7, |log, _| {
                log.push("b");
                Ok(())
            });
            Ok(())
        });

        let mut log = Log::new();
        registry.fire_next_context(&mut log, 7)?;
        assert_eq!(log, vec!["a"]);
        registry.fire_next_context(&mut log, 7)?;
        assert_eq!(log, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn failing_action_drops_the_rest() {
        let mut registry = DeferRegistry::<Log>::new();
        registry.on_end_of_block(|_, _| Err(TraceError::NoOpenSegment));
        registry.on_end_of_block(|log, _| {
            log.push("never");
            Ok(())
        });

        let mut log = Log::new();
        assert_eq!(
            registry.fire_end_of_block(&mut log),
            Err(TraceError::NoOpenSegment)
        );
        assert!(log.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn rollback_keeps_earlier_actions() -> TraceResult<()> {
        let mut registry = DeferRegistry::<Log>::new();
        registry.on_end_of_block(|log, _| {
            log.push("committed");
            Ok(())
        });

        let checkpoint = registry.checkpoint()?;
        registry.on_end_of_block(|log, _| {
            log.push("discarded");
            Ok(())
        });
        registry.on_end_of_transaction(|log, _| {
            log.push("discarded");
            Ok(())
        });
        registry.on_next_context(0, |log, _| {
            log.push("discarded");
            Ok(())
        });
        registry.rollback(checkpoint);

        assert_eq!(registry.pending(Checkpoint::EndOfTransaction), 0);
        assert_eq!(registry.pending(Checkpoint::NextContext), 0);

        let mut log = Log::new();
        registry.fire_end_of_block(&mut log)?;
        assert_eq!(log, vec!["committed"]);
        Ok(())
    }

    #[test]
    fn transaction_work_cannot_cross_a_checkpoint() {
        let mut registry = DeferRegistry::<Log>::new();
        registry.on_end_of_transaction(|log, _| {
            log.push("inherited");
            Ok(())
        });

        assert_eq!(
            registry.checkpoint(),
            Err(TraceError::DeferredOutsideTransaction {
                checkpoint: Checkpoint::EndOfTransaction,
                pending: 1,
            })
        );
        assert_eq!(registry.clear_transaction_scope(), 1);
        assert!(registry.checkpoint().is_ok());
    }

    #[test]
    fn reentrant_transaction_work_ends_with_the_transaction() -> TraceResult<()> {
        let mut registry = DeferRegistry::<Log>::new();
        registry.on_end_of_transaction(|log, registry| {
            log.push("outer");
            registry.on_end_of_transaction(|log, _| {
                log.push("inner");
                Ok(())
            });
            Ok(())
        });

        let mut log = Log::new();
        registry.fire_end_of_transaction(&mut log)?;
        assert_eq!(registry.clear_transaction_scope(), 1);
        assert_eq!(log, vec!["outer"]);

        // The next transaction starts clean, so discarding it loses nothing.
        let next = registry.checkpoint()?;
        registry.rollback(next);
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn schedule_dispatches_on_variant() {
        let mut registry = DeferRegistry::<Log>::new();
        let actions: Vec<DeferredAction<Log>> = vec![
            DeferredAction::EndOfOpcode(Box::new(|_, _| Ok(()))),
            DeferredAction::NextContext {
                target_frame: 3,
                action: Box::new(|_, _| Ok(())),
            },
            DeferredAction::EndOfBlock(Box::new(|_, _| Ok(()))),
        ];
        for action in actions {
            registry.schedule(action);
        }

        assert_eq!(registry.pending(Checkpoint::EndOfOpcode), 1);
        assert_eq!(registry.pending(Checkpoint::NextContext), 1);
        assert_eq!(registry.pending(Checkpoint::EndOfTransaction), 0);
        assert_eq!(registry.pending(Checkpoint::EndOfBlock), 1);

        assert_eq!(registry.clear_transaction_scope(), 2);
        assert_eq!(registry.pending(Checkpoint::EndOfBlock), 1);
        assert!(registry.ensure_no_transaction_scope().is_ok());

        registry.clear_all();
        assert!(registry.is_empty());
    }
}
