// Copyright 2018-2025 the Deno authors. MIT license.

//! The asynchronous I/O layer a [`crate::StreamLoop`] drives.
//!
//! A substrate owns the OS-level streams. It is told what to do through the
//! primitives below and reports results either synchronously (issue-time
//! errors) or later, as [`Completion`]s collected by
//! [`Substrate::poll_completions`] and reads polled by
//! [`Substrate::poll_read`].

mod memory;
#[cfg(feature = "tcp")]
mod tcp;

pub use memory::MemoryScript;
pub use memory::MemorySubstrate;
#[cfg(feature = "tcp")]
pub use tcp::TcpSubstrate;

use crate::callback_context::RequestId;
use crate::error::UvError;
use crate::handle_table::HandleId;
use crate::stream::HandleKind;
use bytes::Bytes;
use std::net::SocketAddr;
use std::task::Context;
use std::task::Poll;

/// Result of one read attempt on a reading handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
  /// `n` bytes were placed at the start of the buffer. `Data(0)` carries no
  /// information and is ignored.
  Data(usize),
  /// The peer closed its writable side.
  Eof,
  Err(UvError),
}

/// An operation finished inside the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
  /// A new connection is waiting on a listening handle.
  Connection {
    server: HandleId,
    status: Result<(), UvError>,
  },
  Write {
    req: RequestId,
    status: Result<(), UvError>,
  },
  Shutdown {
    req: RequestId,
    status: Result<(), UvError>,
  },
  Connect {
    req: RequestId,
    status: Result<(), UvError>,
  },
}

pub trait Substrate {
  /// A handle was created on the loop.
  fn init(&mut self, handle: HandleId, kind: HandleKind);

  /// Adopts an already connected OS stream.
  fn open(
    &mut self,
    handle: HandleId,
    stream: std::net::TcpStream,
  ) -> Result<(), UvError> {
    let _ = (handle, stream);
    Err(UvError::ENOTSUP)
  }

  fn bind(&mut self, handle: HandleId, addr: SocketAddr) -> Result<(), UvError> {
    let _ = (handle, addr);
    Err(UvError::ENOTSUP)
  }

  fn listen(&mut self, handle: HandleId, backlog: u32) -> Result<(), UvError>;

  /// Moves one pending connection from `server` onto `client`.
  fn accept(
    &mut self,
    server: HandleId,
    client: HandleId,
  ) -> Result<(), UvError>;

  fn read_start(&mut self, handle: HandleId) -> Result<(), UvError>;

  fn read_stop(&mut self, handle: HandleId) -> Result<(), UvError>;

  /// Attempts one read into `buf`. `Poll::Pending` means nothing is available
  /// yet and the task in `cx` will be woken when there is.
  fn poll_read(
    &mut self,
    cx: &mut Context,
    handle: HandleId,
    buf: &mut [u8],
  ) -> Poll<ReadStatus>;

  /// Queues `data`. An `Err` is a refusal at issue time; otherwise exactly
  /// one [`Completion::Write`] for `req` follows.
  fn write(
    &mut self,
    req: RequestId,
    handle: HandleId,
    data: Bytes,
  ) -> Result<(), UvError>;

  /// Half-closes the writable side once queued writes are flushed.
  fn shutdown(&mut self, req: RequestId, handle: HandleId)
  -> Result<(), UvError>;

  fn connect(
    &mut self,
    req: RequestId,
    handle: HandleId,
    addr: SocketAddr,
  ) -> Result<(), UvError> {
    let _ = (req, handle, addr);
    Err(UvError::ENOTSUP)
  }

  /// Bytes queued on `handle` but not yet handed to the OS.
  fn write_queue_size(&self, handle: HandleId) -> usize;

  fn local_addr(&self, handle: HandleId) -> Result<SocketAddr, UvError> {
    let _ = handle;
    Err(UvError::ENOTSUP)
  }

  /// Releases the OS resources of `handle`. Requests still pending on it
  /// complete with `ECANCELED`.
  fn close(&mut self, handle: HandleId);

  /// Moves every finished operation into `out`.
  fn poll_completions(&mut self, cx: &mut Context, out: &mut Vec<Completion>);
}
