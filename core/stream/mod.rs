// Copyright 2018-2025 the Deno authors. MIT license.

//! Stream operations.
//!
//! Every operation validates the handle's state, records whatever must
//! survive until completion, and then hands off to the [`Substrate`].
//! Misuse is reported synchronously as a [`StreamError`]. Failures the
//! substrate reports later arrive as an [`AsyncError`] through the "error"
//! event or the operation's callback.

mod handle;
#[cfg(test)]
mod tests;

pub use handle::HandleKind;
pub use handle::StreamState;
pub(crate) use handle::ReadState;
pub(crate) use handle::StreamHandle;

use crate::callback_context::CallbackContext;
use crate::callback_context::RequestId;
use crate::callback_context::RequestTable;
use crate::error::AnyError;
use crate::error::AsyncError;
use crate::error::StreamError;
use crate::error::UvError;
use crate::events::EventEmitter;
use crate::events::EventName;
use crate::events::StreamEvent;
use crate::handle_table::HandleId;
use crate::handle_table::HandleTable;
use crate::handle_table::RefToken;
use crate::handle_table::Release;
use crate::metrics::StreamMetricsEvent;
use crate::metrics::StreamOp;
use crate::options::LoopOptions;
use crate::read_buffer::ReadBuffer;
use crate::substrate::Completion;
use crate::substrate::Substrate;
use bytes::Bytes;
use deno_unsync::UnsyncWaker;
use futures::FutureExt;
use futures::channel::oneshot;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;

/// Owns every stream handle and dispatches their completions.
///
/// A `StreamLoop` is single threaded. All methods take `&self` so that
/// listeners and callbacks, which receive the loop by reference, can issue
/// further operations while they run.
pub struct StreamLoop {
  pub(crate) options: LoopOptions,
  pub(crate) handles: RefCell<HandleTable<StreamHandle>>,
  pub(crate) requests: RefCell<RequestTable>,
  pub(crate) emitter: EventEmitter,
  pub(crate) substrate: RefCell<Box<dyn Substrate>>,
  /// Completions produced at issue time, delivered in the next pending
  /// callbacks phase.
  pub(crate) deferred: RefCell<VecDeque<Completion>>,
  /// Handles whose last reference is gone, reclaimed in the close phase.
  pub(crate) closing: RefCell<VecDeque<HandleId>>,
  pub(crate) stop_flag: Cell<bool>,
  pub(crate) waker: UnsyncWaker,
}

static_assertions::assert_not_impl_any!(StreamLoop: Send, Sync);

impl StreamLoop {
  pub fn new(substrate: impl Substrate + 'static, options: LoopOptions) -> Self {
    Self {
      options,
      handles: RefCell::new(HandleTable::default()),
      requests: RefCell::new(RequestTable::default()),
      emitter: EventEmitter::default(),
      substrate: RefCell::new(Box::new(substrate)),
      deferred: RefCell::new(VecDeque::new()),
      closing: RefCell::new(VecDeque::new()),
      stop_flag: Cell::new(false),
      waker: UnsyncWaker::default(),
    }
  }

  pub fn options(&self) -> &LoopOptions {
    &self.options
  }

  /// Creates a handle in the `Idle` state.
  pub fn new_handle(&self, kind: HandleKind) -> HandleId {
    let id = self.handles.borrow_mut().add(StreamHandle::new(kind));
    self.substrate.borrow_mut().init(id, kind);
    log::trace!("new {kind:?} handle {id}");
    id
  }

  pub(crate) fn handle(
    &self,
    id: HandleId,
  ) -> Result<Rc<StreamHandle>, StreamError> {
    self.handles.borrow().get(id)
  }

  pub fn state(&self, id: HandleId) -> Result<StreamState, StreamError> {
    Ok(self.handle(id)?.state.get())
  }

  pub fn kind(&self, id: HandleId) -> Result<HandleKind, StreamError> {
    Ok(self.handle(id)?.kind)
  }

  pub fn is_reading(&self, id: HandleId) -> bool {
    self.handle(id).is_ok_and(|handle| handle.is_reading())
  }

  /// Outstanding references on `id`, or `None` once it has been reclaimed.
  pub fn ref_count(&self, id: HandleId) -> Option<usize> {
    self.handles.borrow().ref_count(id)
  }

  pub fn handle_count(&self) -> usize {
    self.handles.borrow().len()
  }

  /// Writes, shutdowns and connects still waiting for their completion.
  pub fn pending_requests(&self, id: HandleId) -> usize {
    self.requests.borrow().pending_for(id)
  }

  /// The handle's read buffer, if a read session ever started.
  pub fn read_buffer(
    &self,
    id: HandleId,
  ) -> Result<Option<Rc<ReadBuffer>>, StreamError> {
    Ok(self.handle(id)?.read_buffer.borrow().clone())
  }

  pub fn local_addr(&self, id: HandleId) -> Result<SocketAddr, StreamError> {
    self.handle(id)?;
    self
      .substrate
      .borrow()
      .local_addr(id)
      .map_err(|err| StreamError::Substrate {
        op: "local_addr",
        err,
      })
  }

  /// Registers `listener` for `name` events on `id`.
  pub fn on(
    &self,
    id: HandleId,
    name: EventName,
    listener: impl Fn(&StreamLoop, &StreamEvent<'_>) -> Result<(), AnyError>
    + 'static,
  ) -> Result<(), StreamError> {
    self.handle(id)?;
    self.emitter.on(id, name, Rc::new(listener));
    Ok(())
  }

  pub fn listener_count(&self, id: HandleId, name: EventName) -> usize {
    self.emitter.listener_count(id, name)
  }

  pub(crate) fn emit(
    &self,
    id: HandleId,
    event: &StreamEvent<'_>,
  ) -> Result<(), AnyError> {
    self.emitter.emit(self, id, event)
  }

  pub(crate) fn dispatch_metrics(
    &self,
    id: HandleId,
    op: StreamOp,
    event: StreamMetricsEvent,
  ) {
    if let Some(metrics) = &self.options.metrics {
      metrics(id, op, event);
    }
  }

  fn track<T>(
    &self,
    id: HandleId,
    op: StreamOp,
    f: impl FnOnce() -> Result<T, StreamError>,
  ) -> Result<T, StreamError> {
    self.dispatch_metrics(id, op, StreamMetricsEvent::Dispatched);
    let result = f();
    let event = if result.is_ok() {
      StreamMetricsEvent::Completed
    } else {
      StreamMetricsEvent::Error
    };
    self.dispatch_metrics(id, op, event);
    result
  }

  fn acquire(&self, id: HandleId) -> Result<RefToken, StreamError> {
    self.handles.borrow_mut().acquire(id)
  }

  /// Returns a reference to the table and queues the handle for reclaim if
  /// it was the last one on a closing handle.
  pub(crate) fn release(&self, token: RefToken) {
    let id = token.handle();
    let outcome = self.handles.borrow_mut().release(token);
    if outcome == Release::Reclaimable {
      self.closing.borrow_mut().push_back(id);
    }
  }

  /// Starts accepting connections on `id`. `on_connection` runs for every
  /// incoming connection and is expected to call [`StreamLoop::accept`].
  pub fn listen(
    &self,
    id: HandleId,
    backlog: Option<u32>,
    on_connection: impl Fn(&StreamLoop, HandleId) -> Result<(), AnyError>
    + 'static,
  ) -> Result<(), StreamError> {
    self.track(id, StreamOp::Listen, move || {
      let handle = self.handle(id)?;
      let state = handle.state.get();
      if state != StreamState::Idle {
        return Err(StreamError::InvalidState {
          op: "listen",
          state,
        });
      }
      let backlog = backlog.unwrap_or(self.options.default_backlog);
      let listening = self.substrate.borrow_mut().listen(id, backlog);
      listening.map_err(StreamError::Listen)?;

      let token = self.acquire(id)?;
      *handle.listen_token.borrow_mut() = Some(token);
      handle.state.set(StreamState::Listening);
      self.emitter.on(
        id,
        EventName::Connection,
        Rc::new(move |lp: &StreamLoop, _: &StreamEvent<'_>| {
          on_connection(lp, id)
        }),
      );
      log::debug!("handle {id} listening, backlog {backlog}");
      self.waker.wake();

      self.emit(id, &StreamEvent::Listening)?;
      Ok(())
    })
  }

  /// Takes one pending connection off `server` and attaches it to `client`.
  pub fn accept(
    &self,
    server: HandleId,
    client: HandleId,
  ) -> Result<(), StreamError> {
    self.track(server, StreamOp::Accept, || {
      let state = self.handle(server)?.state.get();
      if state != StreamState::Listening {
        return Err(StreamError::InvalidState { op: "accept", state });
      }
      let client_handle = self.handle(client)?;
      let state = client_handle.state.get();
      if state != StreamState::Idle {
        return Err(StreamError::InvalidState { op: "accept", state });
      }
      let accepted = self.substrate.borrow_mut().accept(server, client);
      accepted.map_err(StreamError::Accept)?;
      client_handle.state.set(StreamState::Connected);
      log::trace!("handle {server} accepted into {client}");
      // The substrate may be holding further connections back until this one
      // was taken.
      self.waker.wake();
      Ok(())
    })
  }

  /// Adopts an already connected socket.
  pub fn open(
    &self,
    id: HandleId,
    stream: std::net::TcpStream,
  ) -> Result<(), StreamError> {
    let handle = self.handle(id)?;
    let state = handle.state.get();
    if state != StreamState::Idle {
      return Err(StreamError::InvalidState { op: "open", state });
    }
    let opened = self.substrate.borrow_mut().open(id, stream);
    opened.map_err(|err| StreamError::Substrate { op: "open", err })?;
    handle.state.set(StreamState::Connected);
    Ok(())
  }

  pub fn bind(&self, id: HandleId, addr: SocketAddr) -> Result<(), StreamError> {
    let state = self.handle(id)?.state.get();
    if state != StreamState::Idle {
      return Err(StreamError::InvalidState { op: "bind", state });
    }
    let bound = self.substrate.borrow_mut().bind(id, addr);
    bound.map_err(StreamError::Bind)
  }

  /// Starts a read session. "data" events are emitted until EOF, a read
  /// error, [`StreamLoop::read_stop`] or [`StreamLoop::close`].
  pub fn read_start(&self, id: HandleId) -> Result<(), StreamError> {
    self.track(id, StreamOp::ReadStart, || {
      let handle = self.handle(id)?;
      let state = handle.state.get();
      if !state.can_read() {
        return Err(StreamError::InvalidState {
          op: "read_start",
          state,
        });
      }
      if handle.is_reading() {
        return Err(StreamError::AlreadyReading);
      }
      handle.read_buffer(self.options.read_buffer_size.get());

      let token = self.acquire(id)?;
      let started = self.substrate.borrow_mut().read_start(id);
      if let Err(err) = started {
        self.release(token);
        return Err(StreamError::Substrate {
          op: "read_start",
          err,
        });
      }
      handle.replace_read(ReadState::Reading(token));
      self.waker.wake();
      Ok(())
    })
  }

  pub fn read_stop(&self, id: HandleId) -> Result<(), StreamError> {
    self.track(id, StreamOp::ReadStop, || {
      let handle = self.handle(id)?;
      match handle.replace_read(ReadState::Stopped) {
        ReadState::Reading(token) => {
          self.stop_substrate_read(id);
          self.release(token);
          Ok(())
        }
        ReadState::Ended => Ok(()),
        ReadState::Stopped => Err(StreamError::NotReading),
      }
    })
  }

  pub(crate) fn stop_substrate_read(&self, id: HandleId) {
    let stopped = self.substrate.borrow_mut().read_stop(id);
    if let Err(err) = stopped {
      log::debug!("handle {id}: read_stop failed: {err}");
    }
  }

  /// Queues `data` for writing. `on_complete` runs exactly once, from the
  /// event loop, with the outcome.
  pub fn write(
    &self,
    id: HandleId,
    data: impl Into<Bytes>,
    on_complete: impl FnOnce(&StreamLoop, Result<(), AsyncError>) + 'static,
  ) -> Result<RequestId, StreamError> {
    let data = data.into();
    self.track(id, StreamOp::Write, move || {
      let handle = self.handle(id)?;
      let state = handle.state.get();
      if state != StreamState::Connected {
        return Err(StreamError::NotWritable { op: "write", state });
      }
      let token = self.acquire(id)?;
      let req = self.requests.borrow().next_id();
      let issued = self.substrate.borrow_mut().write(req, id, data.clone());
      let len = data.len();
      self.requests.borrow_mut().insert(CallbackContext::Write {
        handle: id,
        data,
        cb: Box::new(on_complete),
        token,
      });
      if let Err(err) = issued {
        log::debug!("handle {id}: write of {len} bytes refused: {err}");
        self
          .deferred
          .borrow_mut()
          .push_back(Completion::Write { req, status: Err(err) });
      }
      self.waker.wake();
      Ok(req)
    })
  }

  /// Like [`StreamLoop::write`], but resolves a future instead of calling
  /// back. The future only makes progress while the loop is driven.
  pub fn write_async(
    &self,
    id: HandleId,
    data: impl Into<Bytes>,
  ) -> Result<impl Future<Output = Result<(), AsyncError>> + 'static, StreamError>
  {
    let (tx, rx) = oneshot::channel();
    self.write(id, data, move |_, result| {
      let _ = tx.send(result);
    })?;
    Ok(rx.map(|result| {
      result
        .unwrap_or_else(|_| Err(AsyncError::new(UvError::ECANCELED, "after_write")))
    }))
  }

  /// Bytes queued on `id` that the substrate has not sent yet.
  pub fn write_queue_size(&self, id: HandleId) -> Result<usize, StreamError> {
    self.handle(id)?;
    Ok(self.substrate.borrow().write_queue_size(id))
  }

  /// Half-closes the writable side once queued writes are flushed. Writes are
  /// refused from the moment this returns.
  pub fn shutdown(
    &self,
    id: HandleId,
    on_complete: impl FnOnce(&StreamLoop, Result<(), AsyncError>) + 'static,
  ) -> Result<RequestId, StreamError> {
    self.track(id, StreamOp::Shutdown, move || {
      let handle = self.handle(id)?;
      let state = handle.state.get();
      if state != StreamState::Connected {
        return Err(StreamError::NotWritable {
          op: "shutdown",
          state,
        });
      }
      let token = self.acquire(id)?;
      handle.state.set(StreamState::ShuttingDown);
      let req = self.requests.borrow().next_id();
      let issued = self.substrate.borrow_mut().shutdown(req, id);
      self.requests.borrow_mut().insert(CallbackContext::Shutdown {
        handle: id,
        cb: Box::new(on_complete),
        token,
      });
      if let Err(err) = issued {
        log::debug!("handle {id}: shutdown refused: {err}");
        self
          .deferred
          .borrow_mut()
          .push_back(Completion::Shutdown { req, status: Err(err) });
      }
      self.waker.wake();
      Ok(req)
    })
  }

  pub fn shutdown_async(
    &self,
    id: HandleId,
  ) -> Result<impl Future<Output = Result<(), AsyncError>> + 'static, StreamError>
  {
    let (tx, rx) = oneshot::channel();
    self.shutdown(id, move |_, result| {
      let _ = tx.send(result);
    })?;
    Ok(rx.map(|result| {
      result.unwrap_or_else(|_| {
        Err(AsyncError::new(UvError::ECANCELED, "after_shutdown"))
      })
    }))
  }

  /// Connects an idle handle to `addr`. The outcome is reported through the
  /// "connect" or "error" event.
  pub fn connect(
    &self,
    id: HandleId,
    addr: SocketAddr,
  ) -> Result<RequestId, StreamError> {
    self.track(id, StreamOp::Connect, || {
      let handle = self.handle(id)?;
      let state = handle.state.get();
      if state != StreamState::Idle {
        return Err(StreamError::InvalidState {
          op: "connect",
          state,
        });
      }
      let token = self.acquire(id)?;
      let req = self.requests.borrow().next_id();
      let issued = self.substrate.borrow_mut().connect(req, id, addr);
      if let Err(err) = issued {
        self.release(token);
        return Err(StreamError::Substrate { op: "connect", err });
      }
      self
        .requests
        .borrow_mut()
        .insert(CallbackContext::Connect { handle: id, token });
      handle.state.set(StreamState::Connecting);
      self.waker.wake();
      Ok(req)
    })
  }

  /// Closes `id`. Any read session and listen registration end now; the
  /// handle is reclaimed, "close" emitted and `on_close` called once every
  /// pending request on it has completed.
  pub fn close(
    &self,
    id: HandleId,
    on_close: impl FnOnce(&StreamLoop, HandleId) + 'static,
  ) -> Result<(), StreamError> {
    self.track(id, StreamOp::Close, move || {
      let handle = self.handle(id)?;
      let already_closing = self.handles.borrow().is_closing(id);
      if already_closing {
        return Err(StreamError::Closing(id));
      }

      if let ReadState::Reading(token) = handle.replace_read(ReadState::Stopped)
      {
        self.stop_substrate_read(id);
        self.release(token);
      }
      let listen_token = handle.listen_token.borrow_mut().take();
      if let Some(token) = listen_token {
        self.release(token);
      }
      self.substrate.borrow_mut().close(id);

      *handle.on_close.borrow_mut() = Some(Box::new(on_close));
      handle.state.set(StreamState::Closing);
      let outcome = self.handles.borrow_mut().mark_closing(id)?;
      if outcome == Release::Reclaimable {
        self.closing.borrow_mut().push_back(id);
      }
      log::debug!("handle {id} closing");
      self.waker.wake();
      Ok(())
    })
  }
}
