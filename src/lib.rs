//! An async RESP2 client: an incremental streaming decoder plus a
//! pipelining connection pool with pub/sub support.
//!
//! The three layers compose the way a production Redis client's do: a
//! `Decoder` that never assumes a whole reply is available in one read, a
//! `Connection` that pipelines many requests at once over that decoder
//! without callers coordinating, and a `Pool` of such connections with a
//! least-loaded dispatch policy and a dedicated pub/sub connection handed
//! out on demand.
//!
//! ```rust,no_run
//! use resp_pool::create_pool;
//!
//! #[tokio::main]
//! async fn main() -> resp_pool::RespResult<()> {
//!     let pool = create_pool("redis://localhost:6379", 4, 0).await?;
//!     pool.set("hello", "world").await?;
//!     let value = pool.get("hello").await?;
//!     println!("{value:?}");
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod pool;
pub mod pubsub;

#[cfg(test)]
mod tests;

pub use connection::Connection;
pub use decoder::{Decoder, Value};
pub use encoder::Arg;
pub use error::{RespError, RespResult};
pub use pool::{create_pool, Pool};
pub use pubsub::{Message, PubSubHandle};
