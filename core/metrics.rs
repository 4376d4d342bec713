// Copyright 2018-2025 the Deno authors. MIT license.

use crate::handle_table::HandleId;
use std::rc::Rc;

/// The stream operation a metrics event refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum StreamOp {
  Listen,
  Accept,
  ReadStart,
  ReadStop,
  Read,
  Write,
  Shutdown,
  Connect,
  Close,
}

/// The type of stream metrics event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum StreamMetricsEvent {
  /// Entered an operation.
  Dispatched,
  /// Left an operation synchronously.
  Completed,
  /// An operation completed through the event loop.
  CompletedAsync,
  /// Left an operation synchronously with an error.
  Error,
  /// An operation completed through the event loop with an error.
  ErrorAsync,
}

/// A callback to receive a [`StreamMetricsEvent`].
pub type StreamMetricsFn = Rc<dyn Fn(HandleId, StreamOp, StreamMetricsEvent)>;

/// Given two [`StreamMetricsFn`] implementations, merges them so that metric
/// events are delivered to both.
pub fn merge_stream_metrics(
  fn1: Option<StreamMetricsFn>,
  fn2: Option<StreamMetricsFn>,
) -> Option<StreamMetricsFn> {
  match (fn1, fn2) {
    (None, None) => None,
    (Some(a), None) => Some(a),
    (None, Some(b)) => Some(b),
    (Some(a), Some(b)) => Some(Rc::new(move |handle, op, event| {
      a(handle, op, event);
      b(handle, op, event);
    })),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handle_table::HandleTable;
  use std::cell::RefCell;

  #[test]
  fn merged_metrics_reach_both() {
    let seen = Rc::new(RefCell::new(vec![]));
    let recorder = |tag: &'static str| -> StreamMetricsFn {
      let seen = seen.clone();
      Rc::new(move |_: HandleId, op: StreamOp, event: StreamMetricsEvent| {
        seen.borrow_mut().push((tag, op, event))
      })
    };
    let merged =
      merge_stream_metrics(Some(recorder("a")), Some(recorder("b"))).unwrap();

    let mut table = HandleTable::<()>::default();
    merged(table.add(()), StreamOp::Write, StreamMetricsEvent::Dispatched);
    assert_eq!(
      *seen.borrow(),
      vec![
        ("a", StreamOp::Write, StreamMetricsEvent::Dispatched),
        ("b", StreamOp::Write, StreamMetricsEvent::Dispatched),
      ]
    );
    assert!(merge_stream_metrics(None, None).is_none());
  }
}
