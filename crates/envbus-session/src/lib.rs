pub mod error;
pub mod master;
pub mod monitor;
pub mod recorder;
pub mod session;

pub use error::{Op, SessionError};
pub use master::{MasterConfig, MasterConn, StateUpdate};
pub use monitor::{ActivityReport, ActivityWindow, StateMonitor};
pub use recorder::FrameRecorder;
pub use session::{Received, Session, SessionConfig, ACTION_TIMEOUT, SUBSCRIBE_TIMEOUT};
