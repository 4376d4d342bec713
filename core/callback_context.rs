// Copyright 2018-2025 the Deno authors. MIT license.
use crate::error::AsyncError;
use crate::handle_table::HandleId;
use crate::handle_table::RefToken;
use crate::stream::StreamLoop;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one pending write, shutdown or connect. The substrate reports
/// completions by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Invoked exactly once when a write or shutdown completes.
pub type CompletionCallback =
  Box<dyn FnOnce(&StreamLoop, Result<(), AsyncError>)>;

/// State that must survive until a pending request completes.
///
/// Each variant owns the [`RefToken`] that keeps its handle alive. Dropping a
/// context without handing the token back to the table is a bug; the loop
/// always goes through [`RequestTable::take`] and releases the token.
pub enum CallbackContext {
  Write {
    handle: HandleId,
    /// Keeps the source bytes alive until the substrate is done with them.
    data: Bytes,
    cb: CompletionCallback,
    token: RefToken,
  },
  Shutdown {
    handle: HandleId,
    cb: CompletionCallback,
    token: RefToken,
  },
  Connect {
    handle: HandleId,
    token: RefToken,
  },
}

impl CallbackContext {
  pub fn handle(&self) -> HandleId {
    match self {
      CallbackContext::Write { handle, .. }
      | CallbackContext::Shutdown { handle, .. }
      | CallbackContext::Connect { handle, .. } => *handle,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      CallbackContext::Write { .. } => "write",
      CallbackContext::Shutdown { .. } => "shutdown",
      CallbackContext::Connect { .. } => "connect",
    }
  }
}

impl fmt::Debug for CallbackContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut s = f.debug_struct("CallbackContext");
    s.field("kind", &self.kind()).field("handle", &self.handle());
    if let CallbackContext::Write { data, .. } = self {
      s.field("len", &data.len());
    }
    s.finish()
  }
}

/// Pending requests, keyed by a monotonic [`RequestId`].
#[derive(Default)]
pub struct RequestTable {
  index: BTreeMap<RequestId, CallbackContext>,
  next_id: u64,
}

impl RequestTable {
  /// Reserves the id the next [`RequestTable::insert`] will use. The
  /// substrate needs the id before the context exists.
  pub fn next_id(&self) -> RequestId {
    RequestId(self.next_id)
  }

  pub fn insert(&mut self, ctx: CallbackContext) -> RequestId {
    let id = RequestId(self.next_id);
    self.next_id += 1;
    let removed = self.index.insert(id, ctx);
    assert!(removed.is_none());
    id
  }

  /// Removes the context for `id`. `None` means the completion was already
  /// delivered.
  pub fn take(&mut self, id: RequestId) -> Option<CallbackContext> {
    self.index.remove(&id)
  }

  pub fn is_empty(&self) -> bool {
    self.index.is_empty()
  }

  /// Number of requests still pending for `handle`.
  pub fn pending_for(&self, handle: HandleId) -> usize {
    self
      .index
      .values()
      .filter(|ctx| ctx.handle() == handle)
      .count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handle_table::HandleTable;

  #[test]
  fn requests_are_taken_once() {
    let mut handles = HandleTable::<()>::default();
    let h = handles.add(());
    let mut requests = RequestTable::default();

    let expected = requests.next_id();
    let id = requests.insert(CallbackContext::Connect {
      handle: h,
      token: handles.acquire(h).unwrap(),
    });
    assert_eq!(id, expected);
    assert_eq!(requests.pending_for(h), 1);

    let Some(CallbackContext::Connect { token, .. }) = requests.take(id) else {
      panic!("expected a connect context");
    };
    let _ = handles.release(token);
    assert!(requests.take(id).is_none());
    assert!(requests.is_empty());
    assert_ne!(requests.next_id(), id);
  }
}
