pub mod listen;
pub mod write;

pub use listen::{WatchStream, WatchStreamEvent};
pub use write::{WriteStream, WriteStreamEvent};
