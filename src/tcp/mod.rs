//! The TCP engine: segment codec, PCB pool, state machine, retransmission,
//! and the blocking command surface built on top of them.

mod engine;
mod pcb;
mod segment;
mod state;

pub use engine::Engine;
pub use pcb::{PcbTable, PCB_TABLE_SIZE, RECV_BUF_SIZE};
pub use segment::{decode, encode, Flags, Header, Option_};
pub use state::State;
