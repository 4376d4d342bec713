// Copyright 2018-2025 the Deno authors. MIT license.
use crate::error::StreamError;
use bytes::Bytes;
use bytes::BytesMut;
use std::cell::Cell;
use std::cell::RefCell;
use std::ops::Deref;

/// The per-handle buffer that read completions land in.
///
/// The same allocation is reused for every read on a handle. While a slice of
/// it is lent out to "data" listeners the buffer is *exposed*, and nothing may
/// write into it until the dispatch returns.
pub struct ReadBuffer {
  data: RefCell<BytesMut>,
  exposed: Cell<bool>,
}

impl ReadBuffer {
  pub fn new(len: usize) -> Self {
    Self {
      data: RefCell::new(BytesMut::zeroed(len)),
      exposed: Cell::new(false),
    }
  }

  /// Backing length. Never changes after allocation.
  pub fn len(&self) -> usize {
    self.data.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_exposed(&self) -> bool {
    self.exposed.get()
  }

  /// Lets the substrate fill the buffer. Fails if a previous read is still
  /// lent out to listeners.
  pub(crate) fn fill_with<R>(
    &self,
    f: impl FnOnce(&mut [u8]) -> R,
  ) -> Result<R, StreamError> {
    if self.exposed.get() {
      return Err(StreamError::BufferExposed);
    }
    let mut data = self.data.borrow_mut();
    Ok(f(&mut data[..]))
  }

  /// Copies `src` into the buffer at `offset`, truncating at the end of the
  /// buffer. Returns the number of bytes written.
  pub fn write(&self, offset: usize, src: &[u8]) -> Result<usize, StreamError> {
    if self.exposed.get() {
      return Err(StreamError::BufferExposed);
    }
    let mut data = self.data.borrow_mut();
    if offset >= data.len() {
      return Ok(0);
    }
    let n = src.len().min(data.len() - offset);
    data[offset..offset + n].copy_from_slice(&src[..n]);
    Ok(n)
  }

  /// Lends the first `nread` bytes to `f`. The buffer is exposed for exactly
  /// the duration of the call, including when `f` returns an error or
  /// unwinds.
  pub(crate) fn expose<R>(
    &self,
    nread: usize,
    f: impl FnOnce(DataView<'_>) -> R,
  ) -> Result<R, StreamError> {
    if self.exposed.get() {
      return Err(StreamError::BufferExposed);
    }
    let data = self.data.borrow();
    let nread = nread.min(data.len());
    let _guard = ExposeGuard::new(&self.exposed);
    Ok(f(DataView {
      bytes: &data[..nread],
    }))
  }
}

struct ExposeGuard<'a>(&'a Cell<bool>);

impl<'a> ExposeGuard<'a> {
  fn new(flag: &'a Cell<bool>) -> Self {
    flag.set(true);
    Self(flag)
  }
}

impl Drop for ExposeGuard<'_> {
  fn drop(&mut self) {
    self.0.set(false);
  }
}

/// Zero-copy view of the bytes delivered by one read completion. Only valid
/// for the duration of the "data" dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DataView<'a> {
  bytes: &'a [u8],
}

impl DataView<'_> {
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  pub fn to_vec(&self) -> Vec<u8> {
    self.bytes.to_vec()
  }

  /// Copies the view into an owned buffer that outlives the dispatch.
  pub fn to_bytes(&self) -> Bytes {
    Bytes::copy_from_slice(self.bytes)
  }
}

impl Deref for DataView<'_> {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.bytes
  }
}

impl AsRef<[u8]> for DataView<'_> {
  fn as_ref(&self) -> &[u8] {
    self.bytes
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn expose_lends_exact_slice() {
    let buf = ReadBuffer::new(8);
    buf.fill_with(|b| b[..3].copy_from_slice(b"abc")).unwrap();
    let seen = buf
      .expose(3, |view| {
        assert!(buf.is_exposed());
        view.to_vec()
      })
      .unwrap();
    assert_eq!(seen, b"abc".to_vec());
    assert!(!buf.is_exposed());
  }

  #[test]
  fn writes_rejected_while_exposed() {
    let buf = ReadBuffer::new(4);
    buf
      .expose(4, |_| {
        assert!(matches!(buf.write(0, b"x"), Err(StreamError::BufferExposed)));
        assert!(matches!(
          buf.fill_with(|_| ()),
          Err(StreamError::BufferExposed)
        ));
        assert!(matches!(
          buf.expose(1, |_| ()),
          Err(StreamError::BufferExposed)
        ));
      })
      .unwrap();
    assert_eq!(buf.write(2, b"xyz").unwrap(), 2);
  }

  #[test]
  fn guard_clears_on_unwind() {
    let buf = ReadBuffer::new(4);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _: Result<(), _> = buf.expose(2, |_| panic!("listener blew up"));
    }));
    assert!(result.is_err());
    assert!(!buf.is_exposed());
    assert_eq!(buf.write(0, b"ok").unwrap(), 2);
  }
}
