//! Binlog decoding and the VStream change-data-capture engine.
//!
//! The [`binlog`] module turns raw replica-protocol packets into typed
//! binlog events. The [`engine`] module drives them through schema
//! resolution, [`filter`] rule evaluation (including [`keyrange`]
//! membership) and the [`packetizer`] into consumer callbacks, emitting the
//! [`vevent`] union. [`copy`] adds the snapshot-then-tail VStreamCopy mode
//! for initial consumer hydration.

pub mod binlog;
pub mod copy;
pub mod engine;
pub mod filter;
pub mod keyrange;
pub mod packetizer;
pub mod vevent;

pub use copy::{copy_then_stream, FetchBatch, RowFetcher, TableCopySpec};
pub use engine::{BinlogEventSource, Next, StartPosition, VStreamConfig, VStreamer};
pub use filter::{Filter, Rule};
pub use vevent::{Bitmap, Field, Row, RowChange, VEvent};
