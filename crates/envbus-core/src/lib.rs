pub mod action;
pub mod bus;
pub mod channels;
pub mod errors;
pub mod ids;
pub mod memory;
pub mod state;

pub use action::{Action, ACTION_SIZE};
pub use bus::{BusConnection, BusMessage, BusSubscription, Connector};
pub use channels::Channels;
pub use errors::{BusError, CodecError};
pub use ids::EnvId;
pub use memory::MemoryBus;
pub use state::StateFrame;
