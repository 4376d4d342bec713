// Copyright 2018-2025 the Deno authors. MIT license.

//! Stream lifecycle and callback dispatch on top of a libuv-style I/O
//! substrate.
//!
//! A [`StreamLoop`] owns stream handles (TCP sockets, pipes, TTYs) and
//! drives a [`Substrate`] that does the actual I/O. Completions are turned
//! into events ("connection", "data", "end", "error", ...) delivered to
//! listeners, or into calls of the callback given to the operation.
//!
//! ```no_run
//! use uv_stream::EventName;
//! use uv_stream::HandleKind;
//! use uv_stream::LoopOptions;
//! use uv_stream::StreamEvent;
//! use uv_stream::StreamLoop;
//! use uv_stream::TcpSubstrate;
//!
//! # async fn echo() -> Result<(), uv_stream::StreamError> {
//! let lp = StreamLoop::new(TcpSubstrate::new(), LoopOptions::default());
//! let server = lp.new_handle(HandleKind::Tcp);
//! lp.bind(server, "127.0.0.1:7000".parse().unwrap())?;
//! lp.listen(server, None, |lp, server| {
//!   let client = lp.new_handle(HandleKind::Tcp);
//!   lp.accept(server, client)?;
//!   lp.on(client, EventName::Data, move |lp, event| {
//!     if let StreamEvent::Data { view, .. } = event {
//!       lp.write(client, view.to_bytes(), |_, _| {})?;
//!     }
//!     Ok(())
//!   })?;
//!   lp.read_start(client)?;
//!   Ok(())
//! })?;
//! lp.run_event_loop().await
//! # }
//! ```

mod callback_context;
pub mod env;
mod error;
mod event_loop;
mod events;
mod handle_table;
mod metrics;
mod options;
mod read_buffer;
mod stream;
mod substrate;

// Re-exports
pub use anyhow;
pub use bytes;
pub use futures;

pub use crate::callback_context::CompletionCallback;
pub use crate::callback_context::RequestId;
pub use crate::error::AnyError;
pub use crate::error::AsyncError;
pub use crate::error::StreamError;
pub use crate::error::UvError;
pub use crate::event_loop::EventLoopPhase;
pub use crate::event_loop::RunMode;
pub use crate::events::EventName;
pub use crate::events::Listener;
pub use crate::events::StreamEvent;
pub use crate::handle_table::HandleId;
pub use crate::metrics::StreamMetricsEvent;
pub use crate::metrics::StreamMetricsFn;
pub use crate::metrics::StreamOp;
pub use crate::metrics::merge_stream_metrics;
pub use crate::options::LoopOptions;
pub use crate::read_buffer::DataView;
pub use crate::read_buffer::ReadBuffer;
pub use crate::stream::HandleKind;
pub use crate::stream::StreamLoop;
pub use crate::stream::StreamState;
pub use crate::substrate::Completion;
pub use crate::substrate::MemoryScript;
pub use crate::substrate::MemorySubstrate;
pub use crate::substrate::ReadStatus;
pub use crate::substrate::Substrate;
#[cfg(feature = "tcp")]
pub use crate::substrate::TcpSubstrate;
