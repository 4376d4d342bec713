// Copyright 2018-2025 the Deno authors. MIT license.
use crate::error::StreamError;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// A `HandleId` is an integer value referencing a stream handle. It is the
/// stream equivalent of a resource ID: stable for the lifetime of the handle
/// and never reused while the table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u32);

impl HandleId {
  pub const fn as_u32(self) -> u32 {
    self.0
  }
}

impl fmt::Display for HandleId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Proof that one reference on a handle is outstanding.
///
/// Tokens are produced by [`HandleTable::acquire`] and consumed by
/// [`HandleTable::release`]. They cannot be cloned, so a safe caller can never
/// release the same reference twice.
#[must_use = "a RefToken must be released or the handle will never be reclaimed"]
#[derive(Debug)]
pub(crate) struct RefToken {
  id: HandleId,
}

impl RefToken {
  pub fn handle(&self) -> HandleId {
    self.id
  }
}

/// Outcome of dropping a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
  /// The handle still has references, or has not been closed.
  Alive,
  /// The handle is closing and no references remain; it may be reclaimed.
  Reclaimable,
}

struct HandleSlot<T> {
  value: Rc<T>,
  refs: usize,
  closing: bool,
}

/// Arena of stream handles, and the sole authority on their liveness.
///
/// Every asynchronous operation that targets a handle holds a [`RefToken`]
/// for it. A handle is only removed once it has been marked closing and its
/// reference count has dropped to zero.
pub(crate) struct HandleTable<T> {
  index: BTreeMap<HandleId, HandleSlot<T>>,
  next_id: u32,
}

impl<T> Default for HandleTable<T> {
  fn default() -> Self {
    Self {
      index: BTreeMap::new(),
      next_id: 0,
    }
  }
}

impl<T> HandleTable<T> {
  /// Inserts a handle into the table, which takes ownership of it. The new
  /// handle starts with no references.
  pub fn add(&mut self, value: T) -> HandleId {
    let id = HandleId(self.next_id);
    let removed = self.index.insert(
      id,
      HandleSlot {
        value: Rc::new(value),
        refs: 0,
        closing: false,
      },
    );
    assert!(removed.is_none());
    self.next_id += 1;
    id
  }

  pub fn get(&self, id: HandleId) -> Result<Rc<T>, StreamError> {
    self
      .index
      .get(&id)
      .map(|slot| slot.value.clone())
      .ok_or(StreamError::BadHandle(id))
  }

  /// Takes one reference on the handle. Closing handles refuse new
  /// references.
  pub fn acquire(&mut self, id: HandleId) -> Result<RefToken, StreamError> {
    let slot = self.index.get_mut(&id).ok_or(StreamError::BadHandle(id))?;
    if slot.closing {
      return Err(StreamError::Closing(id));
    }
    slot.refs += 1;
    Ok(RefToken { id })
  }

  /// Gives back the reference represented by `token`.
  ///
  /// # Panics
  ///
  /// A release that does not match an acquire means the lifetime tracking is
  /// corrupt, and there is no safe way to continue.
  pub fn release(&mut self, token: RefToken) -> Release {
    let id = token.id;
    let Some(slot) = self.index.get_mut(&id) else {
      panic!("release of handle {id} which is not in the table");
    };
    if slot.refs == 0 {
      panic!("release of handle {id} without a matching acquire");
    }
    slot.refs -= 1;
    if slot.refs == 0 && slot.closing {
      Release::Reclaimable
    } else {
      Release::Alive
    }
  }

  pub fn ref_count(&self, id: HandleId) -> Option<usize> {
    self.index.get(&id).map(|slot| slot.refs)
  }

  pub fn is_closing(&self, id: HandleId) -> bool {
    self.index.get(&id).is_some_and(|slot| slot.closing)
  }

  /// Marks the handle as closing. Returns [`Release::Reclaimable`] if nothing
  /// references it anymore.
  pub fn mark_closing(&mut self, id: HandleId) -> Result<Release, StreamError> {
    let slot = self.index.get_mut(&id).ok_or(StreamError::BadHandle(id))?;
    if slot.closing {
      return Err(StreamError::Closing(id));
    }
    slot.closing = true;
    Ok(if slot.refs == 0 {
      Release::Reclaimable
    } else {
      Release::Alive
    })
  }

  /// Removes a reclaimable handle from the table and returns it.
  ///
  /// # Panics
  ///
  /// Panics if the handle is still referenced or was never closed.
  pub fn take(&mut self, id: HandleId) -> Option<Rc<T>> {
    let slot = self.index.get(&id)?;
    assert!(
      slot.closing && slot.refs == 0,
      "handle {id} reclaimed while still in use ({} refs)",
      slot.refs
    );
    self.index.remove(&id).map(|slot| slot.value)
  }

  /// Returns true if any handle holds at least one reference.
  pub fn has_references(&self) -> bool {
    self.index.values().any(|slot| slot.refs > 0)
  }

  /// Snapshot of the ids currently in the table, in creation order.
  pub fn ids(&self) -> Vec<HandleId> {
    self.index.keys().copied().collect()
  }

  pub fn len(&self) -> usize {
    self.index.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn acquire_release_pairs() {
    let mut table = HandleTable::<&str>::default();
    let id = table.add("tcp");
    assert_eq!(table.ref_count(id), Some(0));

    let a = table.acquire(id).unwrap();
    let b = table.acquire(id).unwrap();
    assert_eq!(table.ref_count(id), Some(2));
    assert!(table.has_references());

    assert_eq!(table.release(a), Release::Alive);
    assert_eq!(table.release(b), Release::Alive);
    assert_eq!(table.ref_count(id), Some(0));
    assert!(!table.has_references());
  }

  #[test]
  fn closing_handle_reclaimed_after_last_release() {
    let mut table = HandleTable::<&str>::default();
    let id = table.add("pipe");
    let token = table.acquire(id).unwrap();

    assert_eq!(table.mark_closing(id).unwrap(), Release::Alive);
    assert!(matches!(table.acquire(id), Err(StreamError::Closing(_))));
    assert!(matches!(table.mark_closing(id), Err(StreamError::Closing(_))));

    assert_eq!(table.release(token), Release::Reclaimable);
    assert_eq!(table.take(id).as_deref(), Some(&"pipe"));
    assert_eq!(table.ref_count(id), None);
    assert!(matches!(table.get(id), Err(StreamError::BadHandle(_))));
  }

  #[test]
  fn unreferenced_handle_is_immediately_reclaimable() {
    let mut table = HandleTable::<u8>::default();
    let id = table.add(1);
    assert_eq!(table.mark_closing(id).unwrap(), Release::Reclaimable);
    assert!(table.take(id).is_some());
    assert_eq!(table.len(), 0);
  }

  #[test]
  fn ids_are_not_reused() {
    let mut table = HandleTable::<u8>::default();
    let a = table.add(1);
    table.mark_closing(a).unwrap();
    table.take(a);
    let b = table.add(2);
    assert_ne!(a, b);
    assert_eq!(table.ids(), vec![b]);
  }

  #[test]
  #[should_panic(expected = "without a matching acquire")]
  fn double_release_is_fatal() {
    let mut table = HandleTable::<u8>::default();
    let id = table.add(1);
    let token = table.acquire(id).unwrap();
    let forged = RefToken { id: token.handle() };
    let _ = table.release(token);
    let _ = table.release(forged);
  }

  #[test]
  #[should_panic(expected = "reclaimed while still in use")]
  fn take_with_outstanding_reference_is_fatal() {
    let mut table = HandleTable::<u8>::default();
    let id = table.add(1);
    let _token = table.acquire(id).unwrap();
    let _ = table.mark_closing(id);
    table.take(id);
  }
}
