//! Bounds-checked binary reading and writing on top of the `bytes` crate,
//! in network byte order. Shared by every crate that touches the wire.

pub mod error;
pub mod io;
pub mod traits;

pub use error::{BinaryError, Result};
pub use io::{BinaryReader, BinaryWriter};
pub use traits::{Readable, Writable};
