// Copyright 2018-2025 the Deno authors. MIT license.
use crate::handle_table::HandleId;
use crate::handle_table::RefToken;
use crate::read_buffer::ReadBuffer;
use crate::stream::StreamLoop;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
  Tcp,
  Pipe,
  Tty,
}

/// Lifecycle state of a stream handle. Whether the handle is reading is
/// tracked separately, so a half-closed stream can keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
  Idle,
  Listening,
  Connecting,
  Connected,
  ShuttingDown,
  ShutDown,
  Closing,
}

impl StreamState {
  pub const fn as_str(self) -> &'static str {
    match self {
      StreamState::Idle => "idle",
      StreamState::Listening => "listening",
      StreamState::Connecting => "connecting",
      StreamState::Connected => "connected",
      StreamState::ShuttingDown => "shutting down",
      StreamState::ShutDown => "shut down",
      StreamState::Closing => "closing",
    }
  }

  pub(crate) const fn can_read(self) -> bool {
    matches!(
      self,
      StreamState::Connected | StreamState::ShuttingDown | StreamState::ShutDown
    )
  }
}

impl fmt::Display for StreamState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

pub(crate) enum ReadState {
  Stopped,
  /// A read session is active and holds a reference on the handle.
  Reading(RefToken),
  /// The session was ended by EOF or a read error; `read_stop` resets it.
  Ended,
}

pub(crate) type CloseCallback = Box<dyn FnOnce(&StreamLoop, HandleId)>;

pub(crate) struct StreamHandle {
  pub kind: HandleKind,
  pub state: Cell<StreamState>,
  pub read: RefCell<ReadState>,
  pub listen_token: RefCell<Option<RefToken>>,
  pub read_buffer: RefCell<Option<Rc<ReadBuffer>>>,
  pub on_close: RefCell<Option<CloseCallback>>,
}

impl StreamHandle {
  pub fn new(kind: HandleKind) -> Self {
    Self {
      kind,
      state: Cell::new(StreamState::Idle),
      read: RefCell::new(ReadState::Stopped),
      listen_token: RefCell::new(None),
      read_buffer: RefCell::new(None),
      on_close: RefCell::new(None),
    }
  }

  pub fn is_reading(&self) -> bool {
    matches!(*self.read.borrow(), ReadState::Reading(_))
  }

  /// Replaces the read state, returning the previous one.
  pub fn replace_read(&self, next: ReadState) -> ReadState {
    std::mem::replace(&mut *self.read.borrow_mut(), next)
  }

  /// The read buffer, allocated on first use.
  pub fn read_buffer(&self, len: usize) -> Rc<ReadBuffer> {
    self
      .read_buffer
      .borrow_mut()
      .get_or_insert_with(|| Rc::new(ReadBuffer::new(len)))
      .clone()
  }
}
