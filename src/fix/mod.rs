//! Safe application of a single fix: instruction, locking, validation, rollback.

pub mod instruction;
pub mod locks;
pub mod protocol;
pub mod validation;

pub use instruction::FixInstruction;
pub use locks::FileLocks;
pub use protocol::FixProtocol;
pub use validation::{ValidationLevel, validate_content};
