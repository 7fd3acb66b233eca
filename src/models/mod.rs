pub mod error;
pub mod health;
pub mod messages;
pub mod metadata;

pub use error::*;
pub use health::*;
pub use messages::*;
pub use metadata::*;
