//! TCP reassembly, per-direction stream readers and UDP pseudo-streams.
//!
//! Each worker's [`Assembler`] feeds a shared [`StreamPool`], which orders
//! segments per connection and drives the [`ReassemblyStream`] callbacks.
//! [`TcpConnection`] implements them, feeding one [`StreamReader`] task
//! per direction. On completion the two directions are merged into a
//! [`Conversation`] and decoded.

mod connection;
mod conversation;
mod engine;
mod factory;
mod fragment;
mod fsm;
mod processor;
mod reader;
mod udp;

pub use connection::{Role, TcpConnection};
pub use conversation::Conversation;
pub use engine::{
    Assembler, Completion, CompletionReason, Delivery, DeliveryStats, FlowDirection, ReassemblyStream, Skip,
    StreamFactory, StreamPool,
};
pub use factory::ConnectionFactory;
pub use fragment::DataFragment;
pub use fsm::{FsmState, OptionChecker, OptionViolation, TcpFsm};
pub use reader::{ActiveReaders, StreamReader};
pub use udp::{UdpStream, UdpStreamPool};

pub(crate) use processor::process_all;
