//! Shared primitives of the factorkeeper distributed factor store:
//! the error taxonomy, the wire protocol, the result-frame codec and
//! the node version gate used between coordinator and executors.

pub mod config;
pub mod error;
pub mod frame;
pub mod proto;
pub mod version;

pub use error::{ErrorKind, FkResult};
pub use frame::ResultFrame;
pub use version::NodeVersion;
