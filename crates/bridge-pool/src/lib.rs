mod buffers;
mod pool;

pub use buffers::{BufferPool, Borrowed, Shelf};
pub use pool::{MAX_IDLE_TIME, PoolError, StreamPool};
