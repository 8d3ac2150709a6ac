// SPDX-License-Identifier: Apache-2.0

//! Session transport for the FinchDB network front-end.
//!
//! This crate carries a connection from the accept socket to the request
//! handler seam and back:
//!
//! - [`message`]: the 16-byte-header binary framing.
//! - [`compress`]: message compression (noop/snappy/zlib), negotiated per
//!   session and wrapped in compressed frames.
//! - [`session`]: the transport session abstraction and its tag word.
//! - [`state_machine`]: the per-connection automaton driving
//!   source/process/sink cycles through a service executor.
//! - [`entry_point`]: session admission, lifetime, and shutdown drain.
//! - [`tcp`] / [`poller`]: the TCP ingress transport, with a readiness
//!   poller backing the asynchronous mode.
//!
//! Command dispatch, authentication, and TLS live elsewhere; they meet
//! this crate at the [`state_machine::RequestHandler`] seam.

pub mod compress;
pub mod entry_point;
pub mod error;
pub mod message;
pub mod poller;
pub mod session;
pub mod state_machine;
pub mod tcp;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use compress::{CompressionManager, CompressorRegistry};
pub use entry_point::ServiceEntryPoint;
pub use error::Error;
pub use message::{MAX_MESSAGE_SIZE, Message, MessageHeader, OpCode};
pub use session::{Session, SessionHandle, SessionTags};
pub use state_machine::{HandlerResponse, RequestHandler, SessionStateMachine};
