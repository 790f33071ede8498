// Podium common library - main library exports

pub mod messages;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod types;

// Flattened re-exports
pub use self::messages::{ControlFrame, Frame, FrameError, InboundMessage};
pub use self::session::{Session, SessionContext, SessionError, SessionStore};
pub use self::snapshot::{reduce, Reduction, SnapshotPatch, StateSnapshot};
pub use self::store::SystemStore;
pub use self::types::*;
