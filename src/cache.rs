//! Buffer pooling for wire I/O.
//!
//! Every frame read from or written to a peer goes through a buffer rented
//! from the process-wide [`BufferPool`]. A rented [`PooledBuffer`] returns
//! itself to the pool when dropped, so early returns and errors never leak
//! pool capacity.
//!
//! # Examples
//!
//! ```
//! use peerwire::cache::BufferPool;
//!
//! let pool = BufferPool::new();
//! {
//!     let mut buf = pool.rent(68);
//!     buf[0] = 19;
//! } // returned here
//! assert_eq!(pool.available(), 1);
//! ```

mod buffer_pool;

pub use buffer_pool::{BufferPool, PooledBuffer};
