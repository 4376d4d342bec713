// Copyright 2018-2025 the Deno authors. MIT license.
use super::Completion;
use super::ReadStatus;
use super::Substrate;
use crate::callback_context::RequestId;
use crate::error::UvError;
use crate::handle_table::HandleId;
use crate::stream::HandleKind;
use bytes::Buf;
use bytes::Bytes;
use deno_unsync::UnsyncWaker;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::task::Context;
use std::task::Poll;

enum Incoming {
  Data(Bytes),
  Eof,
  Err(UvError),
}

#[derive(Default)]
struct MemoryHandle {
  incoming: VecDeque<Incoming>,
  reading: bool,
  listening: Option<u32>,
  pending_connections: usize,
  bound: Option<SocketAddr>,
  written: Vec<u8>,
  held: Vec<(RequestId, Bytes)>,
  pending_shutdown: Option<RequestId>,
  shut: bool,
  closed: bool,
}

#[derive(Default)]
struct MemoryState {
  handles: BTreeMap<HandleId, MemoryHandle>,
  completions: VecDeque<Completion>,
  fail_next_listen: Option<UvError>,
  fail_next_write: Option<UvError>,
  refuse_next_write: Option<UvError>,
  fail_next_shutdown: Option<UvError>,
  fail_next_connect: Option<UvError>,
  hold_writes: bool,
  waker: UnsyncWaker,
}

impl MemoryState {
  fn handle(&mut self, handle: HandleId) -> &mut MemoryHandle {
    self.handles.entry(handle).or_default()
  }

  fn complete(&mut self, completion: Completion) {
    self.completions.push_back(completion);
    self.waker.wake();
  }
}

/// A substrate with no OS resources behind it.
///
/// Everything that would arrive from the network is injected through the
/// paired [`MemoryScript`]. Writes are appended to a per-handle log instead of
/// being sent anywhere.
pub struct MemorySubstrate {
  state: Rc<RefCell<MemoryState>>,
}

/// Drives a [`MemorySubstrate`] from the outside. Cheap to clone.
#[derive(Clone)]
pub struct MemoryScript {
  state: Rc<RefCell<MemoryState>>,
}

impl MemorySubstrate {
  pub fn new() -> (MemorySubstrate, MemoryScript) {
    let state = Rc::new(RefCell::new(MemoryState::default()));
    (
      MemorySubstrate {
        state: state.clone(),
      },
      MemoryScript { state },
    )
  }
}

impl MemoryScript {
  /// An incoming connection arrives on the listening handle `server`.
  pub fn push_connection(&self, server: HandleId) {
    let mut state = self.state.borrow_mut();
    state.handle(server).pending_connections += 1;
    state.complete(Completion::Connection {
      server,
      status: Ok(()),
    });
  }

  pub fn push_connection_error(&self, server: HandleId, err: UvError) {
    self.state.borrow_mut().complete(Completion::Connection {
      server,
      status: Err(err),
    });
  }

  pub fn push_data(&self, handle: HandleId, data: impl Into<Bytes>) {
    self.push_incoming(handle, Incoming::Data(data.into()));
  }

  pub fn push_eof(&self, handle: HandleId) {
    self.push_incoming(handle, Incoming::Eof);
  }

  pub fn push_read_error(&self, handle: HandleId, err: UvError) {
    self.push_incoming(handle, Incoming::Err(err));
  }

  fn push_incoming(&self, handle: HandleId, incoming: Incoming) {
    let mut state = self.state.borrow_mut();
    state.handle(handle).incoming.push_back(incoming);
    state.waker.wake();
  }

  pub fn fail_next_listen(&self, err: UvError) {
    self.state.borrow_mut().fail_next_listen = Some(err);
  }

  /// The next accepted write completes with `err`.
  pub fn fail_next_write(&self, err: UvError) {
    self.state.borrow_mut().fail_next_write = Some(err);
  }

  /// The next write is refused when it is issued.
  pub fn refuse_next_write(&self, err: UvError) {
    self.state.borrow_mut().refuse_next_write = Some(err);
  }

  pub fn fail_next_shutdown(&self, err: UvError) {
    self.state.borrow_mut().fail_next_shutdown = Some(err);
  }

  pub fn fail_next_connect(&self, err: UvError) {
    self.state.borrow_mut().fail_next_connect = Some(err);
  }

  /// Keeps writes queued until [`MemoryScript::flush_writes`].
  pub fn hold_writes(&self) {
    self.state.borrow_mut().hold_writes = true;
  }

  /// Completes every held write, in order, and stops holding.
  pub fn flush_writes(&self) {
    let mut state = self.state.borrow_mut();
    state.hold_writes = false;
    let ids: Vec<HandleId> = state.handles.keys().copied().collect();
    for id in ids {
      let held = std::mem::take(&mut state.handle(id).held);
      for (req, data) in held {
        state.handle(id).written.extend_from_slice(&data);
        state.complete(Completion::Write {
          req,
          status: Ok(()),
        });
      }
      if let Some(req) = state.handle(id).pending_shutdown.take() {
        state.handle(id).shut = true;
        state.complete(Completion::Shutdown {
          req,
          status: Ok(()),
        });
      }
    }
  }

  /// Everything successfully written to `handle` so far.
  pub fn written(&self, handle: HandleId) -> Vec<u8> {
    self
      .state
      .borrow()
      .handles
      .get(&handle)
      .map(|h| h.written.clone())
      .unwrap_or_default()
  }

  pub fn is_shut(&self, handle: HandleId) -> bool {
    self.state.borrow().handles.get(&handle).is_some_and(|h| h.shut)
  }

  pub fn is_reading(&self, handle: HandleId) -> bool {
    self
      .state
      .borrow()
      .handles
      .get(&handle)
      .is_some_and(|h| h.reading)
  }

  pub fn is_closed(&self, handle: HandleId) -> bool {
    self
      .state
      .borrow()
      .handles
      .get(&handle)
      .is_some_and(|h| h.closed)
  }

  /// Backlog the handle was told to listen with.
  pub fn backlog(&self, handle: HandleId) -> Option<u32> {
    self
      .state
      .borrow()
      .handles
      .get(&handle)
      .and_then(|h| h.listening)
  }

  pub fn pending_connections(&self, handle: HandleId) -> usize {
    self
      .state
      .borrow()
      .handles
      .get(&handle)
      .map_or(0, |h| h.pending_connections)
  }
}

impl Substrate for MemorySubstrate {
  fn init(&mut self, handle: HandleId, _kind: HandleKind) {
    self.state.borrow_mut().handle(handle);
  }

  fn bind(&mut self, handle: HandleId, addr: SocketAddr) -> Result<(), UvError> {
    self.state.borrow_mut().handle(handle).bound = Some(addr);
    Ok(())
  }

  fn listen(&mut self, handle: HandleId, backlog: u32) -> Result<(), UvError> {
    let mut state = self.state.borrow_mut();
    if let Some(err) = state.fail_next_listen.take() {
      return Err(err);
    }
    state.handle(handle).listening = Some(backlog);
    Ok(())
  }

  fn accept(
    &mut self,
    server: HandleId,
    client: HandleId,
  ) -> Result<(), UvError> {
    let mut state = self.state.borrow_mut();
    let server = state.handle(server);
    if server.pending_connections == 0 {
      return Err(UvError::EAGAIN);
    }
    server.pending_connections -= 1;
    state.handle(client);
    Ok(())
  }

  fn read_start(&mut self, handle: HandleId) -> Result<(), UvError> {
    self.state.borrow_mut().handle(handle).reading = true;
    Ok(())
  }

  fn read_stop(&mut self, handle: HandleId) -> Result<(), UvError> {
    self.state.borrow_mut().handle(handle).reading = false;
    Ok(())
  }

  fn poll_read(
    &mut self,
    cx: &mut Context,
    handle: HandleId,
    buf: &mut [u8],
  ) -> Poll<ReadStatus> {
    let mut state = self.state.borrow_mut();
    let h = state.handle(handle);
    if !h.reading {
      return Poll::Pending;
    }
    match h.incoming.front_mut() {
      Some(Incoming::Data(data)) => {
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        data.advance(n);
        if data.is_empty() {
          h.incoming.pop_front();
        }
        Poll::Ready(ReadStatus::Data(n))
      }
      Some(Incoming::Eof) => {
        h.incoming.pop_front();
        Poll::Ready(ReadStatus::Eof)
      }
      Some(Incoming::Err(err)) => {
        let err = *err;
        h.incoming.pop_front();
        Poll::Ready(ReadStatus::Err(err))
      }
      None => {
        state.waker.register(cx.waker());
        Poll::Pending
      }
    }
  }

  fn write(
    &mut self,
    req: RequestId,
    handle: HandleId,
    data: Bytes,
  ) -> Result<(), UvError> {
    let mut state = self.state.borrow_mut();
    if let Some(err) = state.refuse_next_write.take() {
      return Err(err);
    }
    if state.hold_writes {
      state.handle(handle).held.push((req, data));
      return Ok(());
    }
    let status = match state.fail_next_write.take() {
      Some(err) => Err(err),
      None => {
        state.handle(handle).written.extend_from_slice(&data);
        Ok(())
      }
    };
    state.complete(Completion::Write { req, status });
    Ok(())
  }

  fn shutdown(
    &mut self,
    req: RequestId,
    handle: HandleId,
  ) -> Result<(), UvError> {
    let mut state = self.state.borrow_mut();
    if let Some(err) = state.fail_next_shutdown.take() {
      state.complete(Completion::Shutdown {
        req,
        status: Err(err),
      });
      return Ok(());
    }
    let h = state.handle(handle);
    if !h.held.is_empty() {
      h.pending_shutdown = Some(req);
      return Ok(());
    }
    h.shut = true;
    state.complete(Completion::Shutdown {
      req,
      status: Ok(()),
    });
    Ok(())
  }

  fn connect(
    &mut self,
    req: RequestId,
    handle: HandleId,
    addr: SocketAddr,
  ) -> Result<(), UvError> {
    let mut state = self.state.borrow_mut();
    let status = match state.fail_next_connect.take() {
      Some(err) => Err(err),
      None => {
        state.handle(handle).bound = Some(addr);
        Ok(())
      }
    };
    state.complete(Completion::Connect { req, status });
    Ok(())
  }

  fn write_queue_size(&self, handle: HandleId) -> usize {
    self.state.borrow().handles.get(&handle).map_or(0, |h| {
      h.held.iter().map(|(_, data)| data.len()).sum()
    })
  }

  fn local_addr(&self, handle: HandleId) -> Result<SocketAddr, UvError> {
    self
      .state
      .borrow()
      .handles
      .get(&handle)
      .and_then(|h| h.bound)
      .ok_or(UvError::EINVAL)
  }

  fn close(&mut self, handle: HandleId) {
    let mut state = self.state.borrow_mut();
    let h = state.handle(handle);
    h.closed = true;
    h.reading = false;
    h.incoming.clear();
    let held = std::mem::take(&mut h.held);
    let shutdown = h.pending_shutdown.take();
    for (req, _) in held {
      state.complete(Completion::Write {
        req,
        status: Err(UvError::ECANCELED),
      });
    }
    if let Some(req) = shutdown {
      state.complete(Completion::Shutdown {
        req,
        status: Err(UvError::ECANCELED),
      });
    }
  }

  fn poll_completions(&mut self, cx: &mut Context, out: &mut Vec<Completion>) {
    let mut state = self.state.borrow_mut();
    state.waker.register(cx.waker());
    out.extend(state.completions.drain(..));
  }
}
