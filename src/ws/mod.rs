//! Upstream connection: the lifecycle machine and the actor that drives it.

pub mod actor;
pub mod machine;

pub use actor::{
    GetConnectionState, GetHealthSnapshot, IngestActor, IngestActorArgs, IngestEvent, Start, Stop,
};
pub use machine::ConnectionMachine;
