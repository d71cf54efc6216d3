//! Corobus: an in-process message bus for cooperatively scheduled tasks.
//!
//! A [`Bus`] multiplexes independently addressable, bounded FIFO channels
//! over which tasks exchange `u32` messages. A producer that finds its
//! channel full and a consumer that finds it empty park on the channel and
//! resume when the condition clears; closing a channel releases every parked
//! waiter with [`BusError::NoChannel`].
//!
//! # Core Guarantees
//!
//! - **FIFO per channel**: messages are delivered in send order, waiters are
//!   woken in wait order
//! - **Capacity bound**: a channel never holds more than `capacity` messages
//! - **No stranded waiters**: every state change wakes exactly as many
//!   counterparts as it enables, and close wakes everyone
//! - **Close safety**: the descriptor slot is vacated before any waiter is
//!   woken, so a resumed task always observes the channel as gone
//!
//! # Blocking and non-blocking surfaces
//!
//! `send`, `recv`, `send_many`, `recv_many` and `broadcast` are futures and
//! may park; their `try_` counterparts never do and instead report
//! [`BusError::WouldBlock`]. `open`, `close` and introspection never park.
//!
//! # Example
//!
//! ```
//! use corobus::{lab::Lab, Bus};
//!
//! let bus = Bus::new();
//! let id = bus.open(2);
//! bus.try_send(id, 7).unwrap();
//! bus.try_send(id, 8).unwrap();
//! assert_eq!(bus.try_recv(id), Ok(7));
//!
//! let mut lab = Lab::new();
//! let worker = bus.clone();
//! lab.spawn(async move {
//!     worker.send(id, 9).await.unwrap();
//! });
//! lab.run_until_stalled();
//!
//! assert_eq!(bus.try_recv(id), Ok(8));
//! assert_eq!(bus.try_recv(id), Ok(9));
//! ```
//!
//! # Module Structure
//!
//! - [`bus`]: the facade: open/close, send/recv, batch, broadcast
//! - [`error`]: error codes and the last-error slot taxonomy
//! - [`lab`]: deterministic single-threaded executor for tests and examples
//! - [`test_utils`]: tracing setup and assertion macros for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod bus;
mod channel;
pub mod error;
pub mod lab;
mod table;
pub mod test_utils;
mod wait;

pub use bus::{Bus, BusMetrics, ChannelId};
pub use channel::Message;
pub use error::{BusError, ErrorCode, Result};
