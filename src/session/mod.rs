pub mod autocommit;
pub mod collab;
pub mod registry;

pub use autocommit::AutoCommitScheduler;
pub use collab::CollabManager;
pub use registry::{RelayFrame, SessionEntry, SessionRegistry};
