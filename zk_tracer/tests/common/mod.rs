#![allow(dead_code)]

use std::sync::Arc;

use ethereum_types::{H160, H256, U256};
use zk_tracer::{
    ColumnProducer, ColumnType, Defers, ExecutionEvent, FrameId, ModuleLimits, ModuleSpec,
    Schema, Sequencer, TraceResult, TraceState, Transaction,
};

pub const ADD: u8 = 0x01;
pub const CALL: u8 = 0xf1;
pub const MODEXP: u8 = 0x05;

/// Operand size above which the modexp module gives up.
pub const MODEXP_MAX_BYTES: u64 = 512;

/// One row per `ADD`, with both operands and the wrapped sum.
pub struct Arith {
    schema: Arc<Schema>,
}

impl Arith {
    pub fn new() -> Self {
        let schema = Schema::new(
            "add",
            [
                ("ARG_1", ColumnType::Unsigned(256)),
                ("ARG_2", ColumnType::Unsigned(256)),
                ("RES", ColumnType::Unsigned(256)),
                ("OVERFLOW", ColumnType::Bool),
            ],
        )
        .unwrap();
        Self { schema }
    }
}

impl ColumnProducer for Arith {
    fn modules(&self) -> Vec<ModuleSpec> {
        vec![ModuleSpec::traced(self.schema.clone())]
    }

    fn on_event(
        &mut self,
        event: &ExecutionEvent,
        state: &mut TraceState,
        _defers: &mut Defers,
    ) -> TraceResult<()> {
        let ExecutionEvent::Opcode {
            opcode: ADD,
            stack_inputs,
            ..
        } = event
        else {
            return Ok(());
        };
        let a = stack_inputs.first().copied().unwrap_or_default();
        let b = stack_inputs.get(1).copied().unwrap_or_default();
        let (res, overflow) = a.overflowing_add(b);

        let mut row = self.schema.row();
        row.set("ARG_1", a)?
            .set("ARG_2", b)?
            .set("RES", res)?
            .set("OVERFLOW", overflow)?;
        state.ledger.append_row("add", row.seal()?)
    }
}

/// Counts one `hub` line per event, `ctx` lines when a called context is
/// entered, and operand words in the unchecked `mmu` module.
pub struct Hub;

impl ColumnProducer for Hub {
    fn modules(&self) -> Vec<ModuleSpec> {
        vec![
            ModuleSpec::counting("hub"),
            ModuleSpec::counting("ctx"),
            ModuleSpec::counting("mmu").unchecked(),
        ]
    }

    fn on_event(
        &mut self,
        event: &ExecutionEvent,
        state: &mut TraceState,
        defers: &mut Defers,
    ) -> TraceResult<()> {
        state.ledger.tally("hub", 1)?;
        if let ExecutionEvent::Opcode {
            frame,
            opcode,
            stack_inputs,
            ..
        } = event
        {
            state.ledger.tally("mmu", stack_inputs.len())?;
            if *opcode == CALL {
                defers.on_next_context(*frame, |state: &mut TraceState, _| {
                    state.ledger.tally("ctx", 1)
                });
            }
        }
        Ok(())
    }
}

/// Flags modexp calls whose operand is too large to be proven.
pub struct Modexp;

impl ColumnProducer for Modexp {
    fn modules(&self) -> Vec<ModuleSpec> {
        vec![ModuleSpec::detecting("modexp")]
    }

    fn on_event(
        &mut self,
        event: &ExecutionEvent,
        state: &mut TraceState,
        _defers: &mut Defers,
    ) -> TraceResult<()> {
        match event {
            ExecutionEvent::Opcode {
                opcode: MODEXP,
                stack_inputs,
                ..
            } => {
                let size = stack_inputs.first().copied().unwrap_or_default();
                state
                    .ledger
                    .detect("modexp", size > U256::from(MODEXP_MAX_BYTES))
            }
            _ => Ok(()),
        }
    }
}

/// Moves the transferred value, records the sender balance once the
/// transaction is over, and lists every transaction at the end of the block.
pub struct Balances {
    balance: Arc<Schema>,
    txn_data: Arc<Schema>,
}

impl Balances {
    pub fn new() -> Self {
        Self {
            balance: Schema::new(
                "balance",
                [
                    ("ADDRESS", ColumnType::Bytes(20)),
                    ("BALANCE", ColumnType::Unsigned(256)),
                ],
            )
            .unwrap(),
            txn_data: Schema::new("txn_data", [("HASH", ColumnType::Bytes(32))]).unwrap(),
        }
    }
}

impl ColumnProducer for Balances {
    fn modules(&self) -> Vec<ModuleSpec> {
        vec![
            ModuleSpec::traced(self.balance.clone()),
            ModuleSpec::traced(self.txn_data.clone()),
        ]
    }

    fn on_transaction_start(
        &mut self,
        tx: &Transaction,
        state: &mut TraceState,
        defers: &mut Defers,
    ) -> TraceResult<()> {
        if let Some(recipient) = tx.recipient {
            state.world.transfer(tx.sender, recipient, tx.value);
        }
        state.world.increment_nonce(tx.sender);

        let sender = tx.sender;
        let balance = self.balance.clone();
        defers.on_end_of_transaction(move |state: &mut TraceState, _| {
            let mut row = balance.row();
            row.set("ADDRESS", sender.as_bytes())?
                .set("BALANCE", state.world.balance(&sender))?;
            state.ledger.append_row("balance", row.seal()?)
        });

        let hash = tx.hash;
        let txn_data = self.txn_data.clone();
        defers.on_end_of_block(move |state: &mut TraceState, _| {
            let mut row = txn_data.row();
            row.set("HASH", hash.as_bytes())?;
            state.ledger.append_row("txn_data", row.seal()?)
        });
        Ok(())
    }
}

/// Lines every block pays in `hub` before any transaction runs.
pub const HUB_SPILLAGE: usize = 5;

/// Tallies one `hub` line per event on top of [`HUB_SPILLAGE`].
pub struct SpilledHub;

impl ColumnProducer for SpilledHub {
    fn modules(&self) -> Vec<ModuleSpec> {
        vec![ModuleSpec::counting("hub").with_spillage(HUB_SPILLAGE)]
    }

    fn on_event(
        &mut self,
        _event: &ExecutionEvent,
        state: &mut TraceState,
        _defers: &mut Defers,
    ) -> TraceResult<()> {
        state.ledger.tally("hub", 1)
    }
}

pub fn spilled_producers() -> Vec<Box<dyn ColumnProducer>> {
    vec![Box::new(SpilledHub)]
}

/// A transaction of `adds` additions that touches no account.
pub fn additions(id: u8, adds: usize) -> Transaction {
    let events = (0..adds).map(|i| op(0, ADD, &[u64::from(id), i as u64]));
    Transaction::new(hash(id), address(id), None).with_events(events)
}

pub fn producers() -> Vec<Box<dyn ColumnProducer>> {
    vec![
        Box::new(Arith::new()),
        Box::new(Hub),
        Box::new(Modexp),
        Box::new(Balances::new()),
    ]
}

/// Generous limits for every module, with `hub` capped at `hub`.
pub fn limits(hub: u64) -> ModuleLimits {
    [
        ("add", 1_000),
        ("balance", 1_000),
        ("ctx", 1_000),
        ("hub", hub),
        ("mmu", 0),
        ("modexp", 1_000),
        ("txn_data", 1_000),
    ]
    .into_iter()
    .collect()
}

pub fn sequencer(limits: ModuleLimits) -> Sequencer {
    let mut sequencer = Sequencer::new(Arc::new(limits));
    for producer in producers() {
        sequencer.register(producer).unwrap();
    }
    sequencer
}

pub fn address(id: u8) -> H160 {
    H160::repeat_byte(id)
}

pub fn hash(id: u8) -> H256 {
    H256::repeat_byte(id)
}

pub fn op(frame: FrameId, opcode: u8, stack_inputs: &[u64]) -> ExecutionEvent {
    ExecutionEvent::Opcode {
        frame,
        parent: frame,
        opcode,
        stack_inputs: stack_inputs.iter().map(|&v| U256::from(v)).collect(),
    }
}

/// A transfer of `value` from account `id` to account `0xee` that runs `adds`
/// additions, tagged with `id` as first operand.
pub fn transfer(id: u8, value: u64, adds: usize) -> Transaction {
    let events = (0..adds).map(|i| op(0, ADD, &[u64::from(id), i as u64]));
    Transaction::new(hash(id), address(id), Some(address(0xee)))
        .with_value(value.into())
        .with_events(events)
}
