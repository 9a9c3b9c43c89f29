// Re-export types from submodules
pub use self::codec::*;
pub use self::messages::*;
pub use self::types::*;

// Declare submodules
mod codec;
mod messages;
mod types;
