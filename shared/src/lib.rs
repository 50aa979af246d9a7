//! UniRoute shared library.
//!
//! Frame model, binary wire codec, and error kinds common to the edge and
//! the CLI client.

pub mod codec;
pub mod error;
pub mod frame;

pub use error::{Error, ErrorKind, Result};
pub use frame::{Frame, Protocol};
