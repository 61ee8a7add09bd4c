//! Concrete transports.

pub mod file;
pub mod tcp;

pub use file::{FileTransport, FileWriter};
pub use tcp::TcpTransport;
