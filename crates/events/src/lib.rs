//! Domain event plumbing: the `Event` contract, the command execution
//! helper, and a lightweight pub/sub bus used to fan audit events out to
//! consumers.

pub mod bus;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
