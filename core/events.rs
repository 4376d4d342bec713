// Copyright 2018-2025 the Deno authors. MIT license.
use crate::error::AnyError;
use crate::error::AsyncError;
use crate::handle_table::HandleId;
use crate::read_buffer::DataView;
use crate::stream::StreamLoop;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventName {
  Listening,
  Connection,
  Connect,
  Data,
  End,
  Error,
  Close,
}

impl EventName {
  pub const fn as_str(self) -> &'static str {
    match self {
      EventName::Listening => "listening",
      EventName::Connection => "connection",
      EventName::Connect => "connect",
      EventName::Data => "data",
      EventName::End => "end",
      EventName::Error => "error",
      EventName::Close => "close",
    }
  }
}

impl fmt::Display for EventName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An event delivered to the listeners of one handle.
#[derive(Debug, Clone, Copy)]
pub enum StreamEvent<'a> {
  Listening,
  Connection,
  Connect,
  /// Bytes lent from the handle's read buffer. `view` is only valid for the
  /// duration of the dispatch.
  Data {
    view: DataView<'a>,
    nread: usize,
  },
  End,
  Error(&'a AsyncError),
  Close,
}

impl StreamEvent<'_> {
  pub const fn name(&self) -> EventName {
    match self {
      StreamEvent::Listening => EventName::Listening,
      StreamEvent::Connection => EventName::Connection,
      StreamEvent::Connect => EventName::Connect,
      StreamEvent::Data { .. } => EventName::Data,
      StreamEvent::End => EventName::End,
      StreamEvent::Error(_) => EventName::Error,
      StreamEvent::Close => EventName::Close,
    }
  }
}

pub type Listener = Rc<dyn Fn(&StreamLoop, &StreamEvent<'_>) -> Result<(), AnyError>>;

type ListenerList = SmallVec<[Listener; 2]>;

/// Per-handle listener registry.
#[derive(Default)]
pub struct EventEmitter {
  listeners: RefCell<BTreeMap<(HandleId, EventName), ListenerList>>,
}

impl EventEmitter {
  pub fn on(&self, handle: HandleId, name: EventName, listener: Listener) {
    self
      .listeners
      .borrow_mut()
      .entry((handle, name))
      .or_default()
      .push(listener);
  }

  /// Calls every listener registered for `event` on `handle`, in registration
  /// order. The list is snapshotted first so listeners may register or close
  /// handles while running. The first error stops the dispatch.
  pub fn emit(
    &self,
    lp: &StreamLoop,
    handle: HandleId,
    event: &StreamEvent<'_>,
  ) -> Result<(), AnyError> {
    let snapshot: ListenerList = match self
      .listeners
      .borrow()
      .get(&(handle, event.name()))
    {
      Some(list) => list.clone(),
      None => return Ok(()),
    };
    for listener in snapshot {
      listener(lp, event)?;
    }
    Ok(())
  }

  pub fn listener_count(&self, handle: HandleId, name: EventName) -> usize {
    self
      .listeners
      .borrow()
      .get(&(handle, name))
      .map_or(0, |list| list.len())
  }

  /// Drops every listener of `handle`.
  pub fn remove_all(&self, handle: HandleId) {
    self
      .listeners
      .borrow_mut()
      .retain(|(h, _), _| *h != handle);
  }
}
