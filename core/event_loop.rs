// Copyright 2018-2025 the Deno authors. MIT license.

//! Phase-based driver for a [`StreamLoop`], following libuv's `uv_run`.
//!
//! Each tick runs these phases **in order**:
//!
//! ```text
//! ┌───────────────────────────────┐
//! │     pending callbacks         │  ← results produced at issue time (refused writes)
//! ├───────────────────────────────┤
//! │          poll                 │  ← substrate completions, then reads on reading handles
//! ├───────────────────────────────┤
//! │      close callbacks          │  ← reclaim closed handles with no references left
//! └───────────────────────────────┘
//! ```
//!
//! A listener error does not interrupt the tick. Bookkeeping for the event
//! that failed is finished, the remaining work of the tick still runs, and
//! the first error is returned at the end. A tick entered from inside a
//! "data" listener cannot read into the lent buffer; that is reported the
//! same way.

use crate::callback_context::CallbackContext;
use crate::callback_context::RequestId;
use crate::error::AnyError;
use crate::error::AsyncError;
use crate::error::StreamError;
use crate::error::UvError;
use crate::events::StreamEvent;
use crate::handle_table::HandleId;
use crate::metrics::StreamMetricsEvent;
use crate::metrics::StreamOp;
use crate::stream::ReadState;
use crate::stream::StreamHandle;
use crate::stream::StreamLoop;
use crate::stream::StreamState;
use crate::substrate::Completion;
use crate::substrate::ReadStatus;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

/// Phase identifiers for the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopPhase {
  /// Deliver results that were produced while an operation was issued.
  PendingCallbacks,
  /// Collect substrate completions and read from every reading handle.
  Poll,
  /// Reclaim closed handles and run their close callbacks.
  CloseCallbacks,
}

impl EventLoopPhase {
  /// Returns all phases in execution order.
  pub const fn all() -> &'static [EventLoopPhase] {
    &[
      EventLoopPhase::PendingCallbacks,
      EventLoopPhase::Poll,
      EventLoopPhase::CloseCallbacks,
    ]
  }
}

/// Run mode for the event loop, matching libuv's `uv_run_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
  /// Run the event loop until there are no more alive handles or requests,
  /// [`StreamLoop::stop`] is called, or a tick makes no progress.
  Default = 0,
  /// Run a single iteration of the event loop.
  Once = 1,
  /// Run a single iteration without blocking for I/O.
  NoWait = 2,
}

/// The first error seen during a tick.
#[derive(Default)]
struct TickErrors(Option<StreamError>);

impl TickErrors {
  fn record(&mut self, result: Result<(), AnyError>) -> bool {
    let Err(err) = result else {
      return false;
    };
    self.push(StreamError::Listener(err));
    true
  }

  fn push(&mut self, err: StreamError) {
    if self.0.is_none() {
      self.0 = Some(err);
    } else {
      log::debug!("error dropped, one is already pending: {err}");
    }
  }
}

impl StreamLoop {
  /// Runs one iteration of the loop. Returns true if any work was done.
  pub fn tick(&self, cx: &mut Context) -> Result<bool, StreamError> {
    let mut errors = TickErrors::default();
    let mut did_work = false;
    for phase in EventLoopPhase::all() {
      log::trace!("phase {phase:?}");
      did_work |= match phase {
        EventLoopPhase::PendingCallbacks => {
          self.run_pending_callbacks(&mut errors)
        }
        EventLoopPhase::Poll => self.run_poll(cx, &mut errors),
        EventLoopPhase::CloseCallbacks => self.run_close_callbacks(&mut errors),
      };
    }
    match errors.0 {
      Some(err) => Err(err),
      None => Ok(did_work),
    }
  }

  /// Drives the loop synchronously, without registering for OS readiness.
  /// Suited to substrates that complete on their own; OS-backed substrates
  /// should use [`StreamLoop::run_event_loop`] instead.
  ///
  /// Returns whether the loop is still alive.
  pub fn run(&self, mode: RunMode) -> Result<bool, StreamError> {
    let mut cx = Context::from_waker(Waker::noop());
    loop {
      let did_work = self.tick(&mut cx)?;
      if self.stop_flag.replace(false) || mode != RunMode::Default {
        break;
      }
      if !did_work || !self.has_alive_handles() {
        break;
      }
    }
    Ok(self.has_alive_handles())
  }

  /// Makes the current [`StreamLoop::run`] or [`StreamLoop::run_event_loop`]
  /// return after the tick in progress.
  pub fn stop(&self) {
    self.stop_flag.set(true);
    self.waker.wake();
  }

  /// True while any handle is referenced, a request is pending, or a close
  /// callback is queued.
  pub fn has_alive_handles(&self) -> bool {
    self.handles.borrow().has_references()
      || !self.requests.borrow().is_empty()
      || !self.deferred.borrow().is_empty()
      || !self.closing.borrow().is_empty()
  }

  pub fn poll_event_loop(
    &self,
    cx: &mut Context,
  ) -> Poll<Result<(), StreamError>> {
    self.waker.register(cx.waker());
    let did_work = self.tick(cx)?;
    if self.stop_flag.replace(false) || !self.has_alive_handles() {
      return Poll::Ready(Ok(()));
    }
    if did_work {
      // Reads may have been cut short by the pass limit.
      cx.waker().wake_by_ref();
    }
    Poll::Pending
  }

  /// Runs the loop until no handle is alive or [`StreamLoop::stop`] is
  /// called.
  pub async fn run_event_loop(&self) -> Result<(), StreamError> {
    futures::future::poll_fn(|cx| self.poll_event_loop(cx)).await
  }

  fn run_pending_callbacks(&self, errors: &mut TickErrors) -> bool {
    // Completions deferred while this phase runs wait for the next tick.
    let batch = std::mem::take(&mut *self.deferred.borrow_mut());
    let did_work = !batch.is_empty();
    for completion in batch {
      self.dispatch_completion(completion, errors);
    }
    did_work
  }

  fn run_poll(&self, cx: &mut Context, errors: &mut TickErrors) -> bool {
    let mut completions = Vec::new();
    self
      .substrate
      .borrow_mut()
      .poll_completions(cx, &mut completions);
    let mut did_work = !completions.is_empty();
    for completion in completions {
      self.dispatch_completion(completion, errors);
    }
    did_work |= self.run_reads(cx, errors);
    did_work
  }

  fn dispatch_completion(&self, completion: Completion, errors: &mut TickErrors) {
    let result = match completion {
      Completion::Connection { server, status } => {
        self.on_connection(server, status)
      }
      Completion::Write { req, status }
      | Completion::Shutdown { req, status }
      | Completion::Connect { req, status } => {
        self.complete_request(req, status)
      }
    };
    errors.record(result);
  }

  fn on_connection(
    &self,
    server: HandleId,
    status: Result<(), UvError>,
  ) -> Result<(), AnyError> {
    let listening = self
      .handle(server)
      .is_ok_and(|handle| handle.state.get() == StreamState::Listening);
    if !listening {
      log::debug!("connection for handle {server}, which is not listening");
      return Ok(());
    }
    match status {
      Ok(()) => {
        self.dispatch_metrics(
          server,
          StreamOp::Listen,
          StreamMetricsEvent::CompletedAsync,
        );
        self.emit(server, &StreamEvent::Connection)
      }
      Err(err) => {
        self.dispatch_metrics(
          server,
          StreamOp::Listen,
          StreamMetricsEvent::ErrorAsync,
        );
        let err = AsyncError::new(err, "on_connection");
        self.emit(server, &StreamEvent::Error(&err))
      }
    }
  }

  /// Delivers the completion of a write, shutdown or connect. The context is
  /// removed from the request table before any user code runs, and its
  /// reference is released once the user code returns.
  fn complete_request(
    &self,
    req: RequestId,
    status: Result<(), UvError>,
  ) -> Result<(), AnyError> {
    let taken = self.requests.borrow_mut().take(req);
    let Some(ctx) = taken else {
      log::warn!("completion for unknown request {req} ignored");
      return Ok(());
    };
    match ctx {
      CallbackContext::Write {
        handle,
        data,
        cb,
        token,
      } => {
        let result = status.map_err(|err| AsyncError::new(err, "after_write"));
        self.async_metrics(handle, StreamOp::Write, result.is_ok());
        log::trace!("handle {handle}: write of {} bytes done", data.len());
        cb(self, result);
        self.release(token);
        drop(data);
        Ok(())
      }
      CallbackContext::Shutdown { handle, cb, token } => {
        let result =
          status.map_err(|err| AsyncError::new(err, "after_shutdown"));
        self.async_metrics(handle, StreamOp::Shutdown, result.is_ok());
        if let Ok(stream) = self.handle(handle)
          && stream.state.get() == StreamState::ShuttingDown
        {
          stream.state.set(if result.is_ok() {
            StreamState::ShutDown
          } else {
            StreamState::Connected
          });
        }
        cb(self, result);
        self.release(token);
        Ok(())
      }
      CallbackContext::Connect { handle, token } => {
        let result =
          status.map_err(|err| AsyncError::new(err, "after_connect"));
        self.async_metrics(handle, StreamOp::Connect, result.is_ok());
        let mut emitted = Ok(());
        if let Ok(stream) = self.handle(handle)
          && stream.state.get() == StreamState::Connecting
        {
          emitted = match &result {
            Ok(()) => {
              stream.state.set(StreamState::Connected);
              self.emit(handle, &StreamEvent::Connect)
            }
            Err(err) => {
              stream.state.set(StreamState::Idle);
              self.emit(handle, &StreamEvent::Error(err))
            }
          };
        }
        self.release(token);
        emitted
      }
    }
  }

  fn async_metrics(&self, id: HandleId, op: StreamOp, ok: bool) {
    let event = if ok {
      StreamMetricsEvent::CompletedAsync
    } else {
      StreamMetricsEvent::ErrorAsync
    };
    self.dispatch_metrics(id, op, event);
  }

  /// Polls every reading handle, up to `max_read_passes` times while reads
  /// keep producing data.
  fn run_reads(&self, cx: &mut Context, errors: &mut TickErrors) -> bool {
    let mut did_work = false;
    'passes: for _pass in 0..self.options.max_read_passes.get() {
      let mut any_work = false;
      let ids = self.handles.borrow().ids();
      for id in ids {
        // Listeners may have stopped or closed the handle since the snapshot.
        let Ok(handle) = self.handle(id) else {
          continue;
        };
        if !handle.is_reading() {
          continue;
        }
        let buffer = handle.read_buffer(self.options.read_buffer_size.get());
        let polled = buffer
          .fill_with(|buf| self.substrate.borrow_mut().poll_read(cx, id, buf));
        let status = match polled {
          Ok(Poll::Ready(status)) => status,
          Ok(Poll::Pending) => continue,
          Err(err) => {
            // Entered from a "data" listener while this buffer is lent out.
            errors.push(err);
            break 'passes;
          }
        };
        let failed = match status {
          ReadStatus::Data(0) => false,
          ReadStatus::Data(nread) => {
            any_work = true;
            self.async_metrics(id, StreamOp::Read, true);
            let exposed = buffer.expose(nread, |view| {
              self.emit(
                id,
                &StreamEvent::Data {
                  view,
                  nread: view.len(),
                },
              )
            });
            match exposed {
              Ok(emitted) => errors.record(emitted),
              Err(err) => {
                errors.push(err);
                true
              }
            }
          }
          ReadStatus::Eof => {
            any_work = true;
            log::trace!("handle {id}: end of stream");
            self.end_read_session(&handle, id);
            errors.record(self.emit(id, &StreamEvent::End))
          }
          ReadStatus::Err(err) => {
            any_work = true;
            self.async_metrics(id, StreamOp::Read, false);
            self.end_read_session(&handle, id);
            let err = AsyncError::new(err, "on_read");
            errors.record(self.emit(id, &StreamEvent::Error(&err)))
          }
        };
        if failed {
          did_work = true;
          break 'passes;
        }
      }
      if !any_work {
        break;
      }
      did_work = true;
    }
    did_work
  }

  fn end_read_session(&self, handle: &StreamHandle, id: HandleId) {
    if let ReadState::Reading(token) = handle.replace_read(ReadState::Ended) {
      self.stop_substrate_read(id);
      self.release(token);
    }
  }

  fn run_close_callbacks(&self, errors: &mut TickErrors) -> bool {
    let batch: Vec<HandleId> = self.closing.borrow_mut().drain(..).collect();
    let did_work = !batch.is_empty();
    for id in batch {
      let taken = self.handles.borrow_mut().take(id);
      let Some(handle) = taken else {
        continue;
      };
      log::debug!("handle {id} reclaimed");
      self.dispatch_metrics(
        id,
        StreamOp::Close,
        StreamMetricsEvent::CompletedAsync,
      );
      let emitted = self.emit(id, &StreamEvent::Close);
      let on_close = handle.on_close.borrow_mut().take();
      if let Some(on_close) = on_close {
        on_close(self, id);
      }
      self.emitter.remove_all(id);
      errors.record(emitted);
    }
    did_work
  }
}
