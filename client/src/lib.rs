//! # Evolu Client
//!
//! The async half of the Evolu stack: the schedule algebra for retry and
//! repetition, the byte-oriented transport seam (WebSocket included), the
//! reference-counted multi-owner sync client, and the [`Evolu`] facade that
//! assembles the engine with all of it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use evolu_client::Evolu;
//! use evolu_engine::{Config, DbSchema, Value};
//!
//! # async fn demo() -> evolu_engine::Result<()> {
//! let schema = DbSchema::new().with_table("todo", ["title"]);
//! let evolu = Evolu::new(Config::default(), schema)?;
//!
//! evolu.insert(
//!     "todo",
//!     BTreeMap::from([("title".to_string(), Value::from("hi"))]),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod evolu;
pub mod retry;
pub mod schedule;
pub mod sync;
pub mod transport;

pub use evolu::{Evolu, QuerySubscription, QueryUpdate};
pub use retry::{repeat, retry};
pub use schedule::{
    during, elapsed, exponential, exponential_with_factor, fibonacci, fixed, forever, from_delay,
    from_delays, linear, once, recurs, retry_strategy_aws, retry_strategy_aws_throttled, spaced,
    succeed, unfold, windowed, Next, Schedule, ScheduleDeps, Step,
};
pub use sync::{SendFn, SyncClient, SyncConfig, SyncDelegate, SyncOwner};
pub use transport::{Connector, Transport, TransportHandler, WebSocketConnector};
