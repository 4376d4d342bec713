// Copyright 2018-2025 the Deno authors. MIT license.
use super::*;
use crate::error::AsyncError;
use crate::event_loop::RunMode;
use crate::substrate::MemoryScript;
use crate::substrate::MemorySubstrate;
use anyhow::anyhow;
use futures::FutureExt;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::cell::Cell;
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::rc::Rc;

type Trace = Rc<RefCell<Vec<String>>>;

const ALL_EVENTS: [EventName; 7] = [
  EventName::Listening,
  EventName::Connection,
  EventName::Connect,
  EventName::Data,
  EventName::End,
  EventName::Error,
  EventName::Close,
];

fn setup() -> (StreamLoop, MemoryScript) {
  setup_with(LoopOptions::default())
}

fn setup_with(options: LoopOptions) -> (StreamLoop, MemoryScript) {
  let (substrate, script) = MemorySubstrate::new();
  (StreamLoop::new(substrate, options), script)
}

fn describe(id: HandleId, event: &StreamEvent<'_>) -> String {
  match event {
    StreamEvent::Data { view, nread } => {
      format!("{id}:data {nread} {}", String::from_utf8_lossy(view))
    }
    StreamEvent::Error(err) => format!("{id}:error {err}"),
    other => format!("{id}:{}", other.name()),
  }
}

/// Appends every event emitted on `id` to `trace`.
fn record(lp: &StreamLoop, id: HandleId, trace: &Trace) {
  for name in ALL_EVENTS {
    let trace = trace.clone();
    lp.on(id, name, move |_, event| {
      trace.borrow_mut().push(describe(id, event));
      Ok(())
    })
    .unwrap();
  }
}

fn trace_of(trace: &Trace) -> Vec<String> {
  trace.borrow().clone()
}

/// A listening server with one accepted, connected client.
fn connected_pair(
  lp: &StreamLoop,
  script: &MemoryScript,
) -> (HandleId, HandleId) {
  let server = lp.new_handle(HandleKind::Tcp);
  lp.listen(server, None, |_, _| Ok(())).unwrap();
  script.push_connection(server);
  lp.run(RunMode::NoWait).unwrap();
  let client = lp.new_handle(HandleKind::Tcp);
  lp.accept(server, client).unwrap();
  (server, client)
}

type Outcomes = Rc<RefCell<Vec<Result<(), AsyncError>>>>;

fn collect(
  outcomes: &Outcomes,
) -> impl FnOnce(&StreamLoop, Result<(), AsyncError>) + 'static {
  let outcomes = outcomes.clone();
  move |_, result| outcomes.borrow_mut().push(result)
}

#[test]
fn listen_then_three_connections() {
  let (lp, script) = setup();
  let trace = Trace::default();
  let server = lp.new_handle(HandleKind::Tcp);
  record(&lp, server, &trace);

  let accepted = Rc::new(RefCell::new(vec![]));
  let accepted_ = accepted.clone();
  lp.listen(server, Some(5), move |lp, server| {
    let client = lp.new_handle(HandleKind::Tcp);
    lp.accept(server, client)?;
    accepted_.borrow_mut().push(client);
    Ok(())
  })
  .unwrap();
  assert_eq!(script.backlog(server), Some(5));
  assert_eq!(lp.state(server).unwrap(), StreamState::Listening);
  assert_eq!(lp.ref_count(server), Some(1));
  assert_eq!(trace_of(&trace), vec!["0:listening"]);

  for _ in 0..3 {
    script.push_connection(server);
  }
  lp.run(RunMode::NoWait).unwrap();

  assert_eq!(
    trace_of(&trace),
    vec!["0:listening", "0:connection", "0:connection", "0:connection"]
  );
  assert_eq!(accepted.borrow().len(), 3);
  for client in accepted.borrow().iter() {
    assert_eq!(lp.state(*client).unwrap(), StreamState::Connected);
    assert_eq!(lp.ref_count(*client), Some(0));
  }
  assert_eq!(script.pending_connections(server), 0);
}

#[test]
fn listen_uses_default_backlog() {
  let (lp, script) = setup_with(LoopOptions {
    default_backlog: 64,
    ..Default::default()
  });
  let server = lp.new_handle(HandleKind::Pipe);
  lp.listen(server, None, |_, _| Ok(())).unwrap();
  assert_eq!(script.backlog(server), Some(64));
}

#[test]
fn listen_failure_leaves_handle_idle() {
  let (lp, script) = setup();
  let server = lp.new_handle(HandleKind::Tcp);
  script.fail_next_listen(UvError::EADDRINUSE);

  let err = lp.listen(server, None, |_, _| Ok(())).unwrap_err();
  assert!(matches!(err, StreamError::Listen(UvError::EADDRINUSE)));
  assert_eq!(err.to_string(), "listen: EADDRINUSE: address already in use");
  assert_eq!(lp.state(server).unwrap(), StreamState::Idle);
  assert_eq!(lp.ref_count(server), Some(0));
  assert_eq!(lp.listener_count(server, EventName::Connection), 0);

  // A second listen on a listening handle is misuse.
  lp.listen(server, None, |_, _| Ok(())).unwrap();
  let err = lp.listen(server, None, |_, _| Ok(())).unwrap_err();
  assert!(matches!(
    err,
    StreamError::InvalidState {
      op: "listen",
      state: StreamState::Listening
    }
  ));
}

#[test]
fn accept_errors() {
  let (lp, _script) = setup();
  let server = lp.new_handle(HandleKind::Tcp);
  let client = lp.new_handle(HandleKind::Tcp);
  let err = lp.accept(server, client).unwrap_err();
  assert!(matches!(err, StreamError::InvalidState { op: "accept", .. }));

  lp.listen(server, None, |_, _| Ok(())).unwrap();
  let err = lp.accept(server, client).unwrap_err();
  assert!(matches!(err, StreamError::Accept(UvError::EAGAIN)));
  assert_eq!(lp.state(client).unwrap(), StreamState::Idle);
}

#[test]
fn connection_failure_is_an_error_event() {
  let (lp, script) = setup();
  let trace = Trace::default();
  let server = lp.new_handle(HandleKind::Tcp);
  record(&lp, server, &trace);
  lp.listen(server, None, |_, _| Ok(())).unwrap();

  script.push_connection_error(server, UvError::ECONNABORTED);
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(
    trace_of(&trace),
    vec![
      "0:listening",
      "0:error ECONNABORTED, software caused connection abort (on_connection)",
    ]
  );
  assert_eq!(lp.state(server).unwrap(), StreamState::Listening);
}

#[test]
fn ten_bytes_then_eof() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let trace = Trace::default();
  record(&lp, client, &trace);

  lp.read_start(client).unwrap();
  assert_eq!(lp.ref_count(client), Some(1));
  script.push_data(client, &b"0123456789"[..]);
  script.push_eof(client);
  lp.run(RunMode::NoWait).unwrap();

  assert_eq!(trace_of(&trace), vec!["1:data 10 0123456789", "1:end"]);
  assert!(!lp.is_reading(client));
  assert_eq!(lp.ref_count(client), Some(0));

  // Nothing more is delivered until the next read_start.
  script.push_data(client, &b"late"[..]);
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(trace_of(&trace).len(), 2);

  // read_stop after the session ended only resets the read state.
  lp.read_stop(client).unwrap();
  assert!(matches!(lp.read_stop(client), Err(StreamError::NotReading)));

  lp.read_start(client).unwrap();
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(
    trace_of(&trace),
    vec!["1:data 10 0123456789", "1:end", "1:data 4 late"]
  );
}

#[test]
fn large_reads_are_split_by_buffer_size() {
  let (lp, script) = setup_with(LoopOptions {
    read_buffer_size: NonZeroUsize::new(4).unwrap(),
    ..Default::default()
  });
  let (_server, client) = connected_pair(&lp, &script);
  let trace = Trace::default();
  record(&lp, client, &trace);

  lp.read_start(client).unwrap();
  assert_eq!(lp.read_buffer(client).unwrap().map(|b| b.len()), Some(4));
  script.push_data(client, &b"abcdefghij"[..]);
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(
    trace_of(&trace),
    vec!["1:data 4 abcd", "1:data 4 efgh", "1:data 2 ij"]
  );
  assert!(lp.is_reading(client));
}

#[test]
fn read_error_ends_session_without_end() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let trace = Trace::default();
  record(&lp, client, &trace);

  lp.read_start(client).unwrap();
  script.push_read_error(client, UvError::ECONNRESET);
  script.push_eof(client);
  lp.run(RunMode::NoWait).unwrap();

  assert_eq!(
    trace_of(&trace),
    vec!["1:error ECONNRESET, connection reset by peer (on_read)"]
  );
  assert!(!lp.is_reading(client));
  assert!(!script.is_reading(client));
  assert_eq!(lp.ref_count(client), Some(0));
}

#[test]
fn read_start_and_stop_misuse() {
  let (lp, script) = setup();
  let idle = lp.new_handle(HandleKind::Tty);
  assert!(matches!(
    lp.read_start(idle),
    Err(StreamError::InvalidState {
      op: "read_start",
      state: StreamState::Idle
    })
  ));
  assert!(matches!(lp.read_stop(idle), Err(StreamError::NotReading)));

  let (_server, client) = connected_pair(&lp, &script);
  lp.read_start(client).unwrap();
  let err = lp.read_start(client).unwrap_err();
  assert!(matches!(err, StreamError::AlreadyReading));
  assert_eq!(err.get_class(), "TypeError");
  assert_eq!(lp.ref_count(client), Some(1));

  lp.read_stop(client).unwrap();
  assert_eq!(lp.ref_count(client), Some(0));
  assert!(!script.is_reading(client));
  assert!(matches!(lp.read_stop(client), Err(StreamError::NotReading)));
}

#[test]
fn exposed_buffer_rejects_writes_during_data() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);

  let seen = Rc::new(RefCell::new(vec![]));
  let seen_ = seen.clone();
  lp.on(client, EventName::Data, move |lp, _| {
    let buffer = lp.read_buffer(client)?.expect("allocated by read_start");
    let direct = buffer.write(0, b"x");
    let reentrant = lp.run(RunMode::NoWait);
    seen_.borrow_mut().push((
      buffer.is_exposed(),
      matches!(direct, Err(StreamError::BufferExposed)),
      matches!(reentrant, Err(StreamError::BufferExposed)),
    ));
    Ok(())
  })
  .unwrap();

  lp.read_start(client).unwrap();
  script.push_data(client, &b"abc"[..]);
  lp.run(RunMode::NoWait).unwrap();

  assert_eq!(*seen.borrow(), vec![(true, true, true)]);
  let buffer = lp.read_buffer(client).unwrap().unwrap();
  assert!(!buffer.is_exposed());
  assert_eq!(buffer.write(0, b"xyz").unwrap(), 3);
}

#[test]
fn reentrant_tick_still_runs_close_callbacks() {
  let (lp, script) = setup();
  let (server, client) = connected_pair(&lp, &script);

  let closed = Rc::new(Cell::new(false));
  let seen = Rc::new(RefCell::new(vec![]));
  let (closed_, seen_) = (closed.clone(), seen.clone());
  lp.on(client, EventName::Data, move |lp, _| {
    let closed = closed_.clone();
    lp.close(server, move |_, _| closed.set(true))?;
    let reentrant = lp.run(RunMode::NoWait);
    seen_.borrow_mut().push((
      matches!(reentrant, Err(StreamError::BufferExposed)),
      closed_.get(),
    ));
    Ok(())
  })
  .unwrap();

  lp.read_start(client).unwrap();
  script.push_data(client, &b"abc"[..]);
  lp.run(RunMode::NoWait).unwrap();

  assert_eq!(*seen.borrow(), vec![(true, true)]);
  assert_eq!(lp.ref_count(server), None);
  assert!(lp.is_reading(client));
}

#[test]
fn listener_error_clears_guard_and_stops_dispatch() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);

  let calls = Rc::new(RefCell::new(vec![]));
  let calls_ = calls.clone();
  lp.on(client, EventName::Data, move |_, event| {
    calls_.borrow_mut().push("first");
    if let StreamEvent::Data { view, .. } = event
      && &view[..] == b"bad"
    {
      return Err(anyhow!("boom"));
    }
    Ok(())
  })
  .unwrap();
  let calls_ = calls.clone();
  lp.on(client, EventName::Data, move |_, _| {
    calls_.borrow_mut().push("second");
    Ok(())
  })
  .unwrap();

  lp.read_start(client).unwrap();
  script.push_data(client, &b"bad"[..]);
  let err = lp.run(RunMode::NoWait).unwrap_err();
  assert!(matches!(err, StreamError::Listener(_)));
  assert_eq!(err.to_string(), "boom");
  assert_eq!(*calls.borrow(), vec!["first"]);

  let buffer = lp.read_buffer(client).unwrap().unwrap();
  assert!(!buffer.is_exposed());
  assert!(lp.is_reading(client));

  script.push_data(client, &b"good"[..]);
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(*calls.borrow(), vec!["first", "first", "second"]);
}

#[test]
fn write_completes_once() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let outcomes = Outcomes::default();

  let req = lp.write(client, "hello", collect(&outcomes)).unwrap();
  assert_eq!(lp.ref_count(client), Some(1));
  assert_eq!(lp.pending_requests(client), 1);
  assert!(outcomes.borrow().is_empty());

  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(*outcomes.borrow(), vec![Ok(())]);
  assert_eq!(script.written(client), b"hello".to_vec());
  assert_eq!(lp.ref_count(client), Some(0));
  assert_eq!(lp.pending_requests(client), 0);

  // A duplicate completion from the substrate is ignored.
  lp.deferred.borrow_mut().push_back(Completion::Write {
    req,
    status: Ok(()),
  });
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(outcomes.borrow().len(), 1);
}

#[rstest]
#[test]
fn failed_write_reports_once(#[values(true, false)] refused_at_issue: bool) {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  lp.read_start(client).unwrap();
  let before = lp.ref_count(client);
  let outcomes = Outcomes::default();

  if refused_at_issue {
    script.refuse_next_write(UvError::EPIPE);
  } else {
    script.fail_next_write(UvError::EPIPE);
  }
  lp.write(client, vec![7u8; 100], collect(&outcomes))
    .expect("failures are not raised at issue time");
  assert!(outcomes.borrow().is_empty());

  lp.run(RunMode::NoWait).unwrap();
  let expected = AsyncError::new(UvError::EPIPE, "after_write");
  assert_eq!(*outcomes.borrow(), vec![Err(expected)]);
  assert_eq!(expected.to_string(), "EPIPE, broken pipe (after_write)");
  assert_eq!(lp.ref_count(client), before);
  assert!(script.written(client).is_empty());
}

#[test]
fn writes_complete_in_order() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let order = Rc::new(RefCell::new(vec![]));

  script.hold_writes();
  for chunk in ["a", "bb", "ccc"] {
    let order = order.clone();
    lp.write(client, chunk, move |_, result| {
      assert!(result.is_ok());
      order.borrow_mut().push(chunk);
    })
    .unwrap();
  }
  assert_eq!(lp.write_queue_size(client).unwrap(), 6);
  assert_eq!(lp.ref_count(client), Some(3));

  script.flush_writes();
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(*order.borrow(), vec!["a", "bb", "ccc"]);
  assert_eq!(script.written(client), b"abbccc".to_vec());
  assert_eq!(lp.write_queue_size(client).unwrap(), 0);
  assert_eq!(lp.ref_count(client), Some(0));
}

#[test]
fn shutdown_then_write_is_refused() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let outcomes = Outcomes::default();

  lp.shutdown(client, collect(&outcomes)).unwrap();
  assert_eq!(lp.state(client).unwrap(), StreamState::ShuttingDown);
  let err = lp.write(client, "late", |_, _| {}).unwrap_err();
  assert!(matches!(
    err,
    StreamError::NotWritable {
      op: "write",
      state: StreamState::ShuttingDown
    }
  ));
  assert!(matches!(
    lp.shutdown(client, |_, _| {}),
    Err(StreamError::NotWritable { op: "shutdown", .. })
  ));

  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(*outcomes.borrow(), vec![Ok(())]);
  assert_eq!(lp.state(client).unwrap(), StreamState::ShutDown);
  assert!(script.is_shut(client));
  assert_eq!(lp.ref_count(client), Some(0));
  assert!(matches!(
    lp.write(client, "later", |_, _| {}),
    Err(StreamError::NotWritable {
      state: StreamState::ShutDown,
      ..
    })
  ));

  // The readable side stays usable.
  lp.read_start(client).unwrap();
  lp.read_stop(client).unwrap();
}

#[test]
fn shutdown_waits_for_queued_writes() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let trace = Rc::new(RefCell::new(vec![]));

  script.hold_writes();
  let trace_ = trace.clone();
  lp.write(client, "bye", move |_, _| trace_.borrow_mut().push("write"))
    .unwrap();
  let trace_ = trace.clone();
  lp.shutdown(client, move |_, _| trace_.borrow_mut().push("shutdown"))
    .unwrap();
  lp.run(RunMode::NoWait).unwrap();
  assert!(trace.borrow().is_empty());

  script.flush_writes();
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(*trace.borrow(), vec!["write", "shutdown"]);
}

#[test]
fn failed_shutdown_restores_connected() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let outcomes = Outcomes::default();

  script.fail_next_shutdown(UvError::ENOTCONN);
  lp.shutdown(client, collect(&outcomes)).unwrap();
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(
    *outcomes.borrow(),
    vec![Err(AsyncError::new(UvError::ENOTCONN, "after_shutdown"))]
  );
  assert_eq!(lp.state(client).unwrap(), StreamState::Connected);
  assert_eq!(lp.ref_count(client), Some(0));
}

#[test]
fn close_waits_for_pending_writes() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let trace = Trace::default();
  record(&lp, client, &trace);

  script.hold_writes();
  for _ in 0..2 {
    let trace = trace.clone();
    lp.write(client, "pending", move |_, result| {
      let status = match result {
        Ok(()) => "ok".to_string(),
        Err(err) => err.name().to_string(),
      };
      trace.borrow_mut().push(format!("1:write {status}"));
    })
    .unwrap();
  }
  lp.read_start(client).unwrap();
  assert_eq!(lp.ref_count(client), Some(3));

  let closed = Rc::new(RefCell::new(None));
  let closed_ = closed.clone();
  lp.close(client, move |_, id| *closed_.borrow_mut() = Some(id))
    .unwrap();
  assert_eq!(lp.state(client).unwrap(), StreamState::Closing);
  assert!(script.is_closed(client));
  // The read session ended, the writes still hold the handle.
  assert_eq!(lp.ref_count(client), Some(2));
  assert!(matches!(
    lp.close(client, |_, _| {}),
    Err(StreamError::Closing(_))
  ));
  assert!(matches!(lp.read_start(client), Err(StreamError::InvalidState { .. })));

  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(
    trace_of(&trace),
    vec!["1:write ECANCELED", "1:write ECANCELED", "1:close"]
  );
  assert_eq!(*closed.borrow(), Some(client));
  assert_eq!(lp.ref_count(client), None);
  assert!(matches!(lp.state(client), Err(StreamError::BadHandle(_))));
  assert_eq!(lp.listener_count(client, EventName::Data), 0);
}

#[test]
fn close_listening_handle() {
  let (lp, script) = setup();
  let trace = Trace::default();
  let server = lp.new_handle(HandleKind::Tcp);
  record(&lp, server, &trace);
  lp.listen(server, None, |_, _| Ok(())).unwrap();
  assert!(lp.has_alive_handles());

  lp.close(server, |_, _| {}).unwrap();
  // Connections arriving after close are not delivered.
  script.push_connection(server);
  assert!(!lp.run(RunMode::Default).unwrap());
  assert_eq!(trace_of(&trace), vec!["0:listening", "0:close"]);
  assert_eq!(lp.handle_count(), 0);
  assert!(!lp.has_alive_handles());
}

#[test]
fn connect_success_and_failure() {
  let (lp, script) = setup();
  let trace = Trace::default();
  let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();

  let ok = lp.new_handle(HandleKind::Tcp);
  record(&lp, ok, &trace);
  lp.connect(ok, addr).unwrap();
  assert_eq!(lp.state(ok).unwrap(), StreamState::Connecting);
  assert_eq!(lp.ref_count(ok), Some(1));
  assert!(matches!(
    lp.write(ok, "early", |_, _| {}),
    Err(StreamError::NotWritable { .. })
  ));

  let refused = lp.new_handle(HandleKind::Tcp);
  record(&lp, refused, &trace);
  lp.run(RunMode::NoWait).unwrap();
  script.fail_next_connect(UvError::ECONNREFUSED);
  lp.connect(refused, addr).unwrap();
  lp.run(RunMode::NoWait).unwrap();

  assert_eq!(
    trace_of(&trace),
    vec![
      "0:connect",
      "1:error ECONNREFUSED, connection refused (after_connect)",
    ]
  );
  assert_eq!(lp.state(ok).unwrap(), StreamState::Connected);
  assert_eq!(lp.state(refused).unwrap(), StreamState::Idle);
  assert_eq!(lp.ref_count(ok), Some(0));
  assert_eq!(lp.ref_count(refused), Some(0));
  assert_eq!(lp.local_addr(ok).unwrap(), addr);
}

#[test]
fn async_write_and_shutdown() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);

  let mut write = Box::pin(lp.write_async(client, "async").unwrap());
  assert!(write.as_mut().now_or_never().is_none());
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(write.now_or_never(), Some(Ok(())));

  script.hold_writes();
  let _held = lp.write_async(client, "held").unwrap();
  let shutdown = lp.shutdown_async(client).unwrap();
  lp.close(client, |_, _| {}).unwrap();
  lp.run(RunMode::NoWait).unwrap();
  assert_eq!(
    shutdown.now_or_never(),
    Some(Err(AsyncError::new(UvError::ECANCELED, "after_shutdown")))
  );
}

#[test]
fn metrics_follow_operations() {
  let events = Rc::new(RefCell::new(vec![]));
  let events_ = events.clone();
  let (lp, script) = setup_with(LoopOptions {
    metrics: Some(Rc::new(
      move |_: HandleId, op: StreamOp, event: StreamMetricsEvent| {
        if op == StreamOp::Write {
          events_.borrow_mut().push(event);
        }
      },
    )),
    ..Default::default()
  });
  let (_server, client) = connected_pair(&lp, &script);

  lp.write(client, "m", |_, _| {}).unwrap();
  lp.run(RunMode::NoWait).unwrap();
  script.fail_next_write(UvError::EPIPE);
  lp.write(client, "m", |_, _| {}).unwrap();
  lp.run(RunMode::NoWait).unwrap();
  lp.shutdown(client, |_, _| {}).unwrap();
  lp.write(client, "m", |_, _| {}).unwrap_err();

  use StreamMetricsEvent::*;
  assert_eq!(
    *events.borrow(),
    vec![
      Dispatched,
      Completed,
      CompletedAsync,
      Dispatched,
      Completed,
      ErrorAsync,
      Dispatched,
      Error,
    ]
  );
}

#[test]
fn stop_interrupts_default_run() {
  let (lp, script) = setup();
  let (_server, client) = connected_pair(&lp, &script);
  let reads = Rc::new(RefCell::new(0));
  let reads_ = reads.clone();
  lp.on(client, EventName::Data, move |lp, _| {
    *reads_.borrow_mut() += 1;
    lp.stop();
    Ok(())
  })
  .unwrap();
  lp.read_start(client).unwrap();
  script.push_data(client, &b"one"[..]);

  assert!(lp.run(RunMode::Default).unwrap());
  assert_eq!(*reads.borrow(), 1);
  // Still reading, but nothing left to do.
  assert!(lp.run(RunMode::Default).unwrap());
  assert_eq!(*reads.borrow(), 1);
}

#[cfg(feature = "tcp")]
mod tcp {
  use super::*;
  use pretty_assertions::assert_eq;
  use crate::substrate::TcpSubstrate;
  use std::time::Duration;

  /// Accepts connections on `server` and echoes everything back, shutting
  /// down and closing once the peer has finished sending.
  fn serve_echo(lp: &StreamLoop, server: HandleId) {
    lp.listen(server, None, |lp, server| {
      let client = lp.new_handle(HandleKind::Tcp);
      lp.accept(server, client)?;
      lp.on(client, EventName::Data, move |lp, event| {
        if let StreamEvent::Data { view, .. } = event {
          lp.write(client, view.to_bytes(), |_, result| {
            assert!(result.is_ok(), "echo write failed: {result:?}");
          })?;
        }
        Ok(())
      })?;
      lp.on(client, EventName::End, move |lp, _| {
        lp.shutdown(client, move |lp, _| {
          let _ = lp.close(client, |_, _| {});
        })?;
        Ok(())
      })?;
      lp.read_start(client)?;
      Ok(())
    })
    .unwrap();
  }

  #[tokio::test]
  async fn tcp_echo_with_tokio_peer() {
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    let lp = StreamLoop::new(TcpSubstrate::new(), LoopOptions::default());
    let server = lp.new_handle(HandleKind::Tcp);
    lp.bind(server, "127.0.0.1:0".parse().unwrap()).unwrap();
    serve_echo(&lp, server);
    let addr = lp.local_addr(server).unwrap();

    let peer = async move {
      let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
      stream.write_all(b"ping").await.unwrap();
      stream.shutdown().await.unwrap();
      let mut echoed = vec![];
      stream.read_to_end(&mut echoed).await.unwrap();
      echoed
    };

    let echoed = tokio::time::timeout(Duration::from_secs(10), async {
      tokio::select! {
        echoed = peer => echoed,
        result = lp.run_event_loop() => panic!("loop exited early: {result:?}"),
      }
    })
    .await
    .expect("echo timed out");
    assert_eq!(echoed, b"ping".to_vec());
  }

  #[tokio::test]
  async fn unaccepted_connection_holds_back_the_rest() {
    let lp = StreamLoop::new(TcpSubstrate::new(), LoopOptions::default());
    let server = lp.new_handle(HandleKind::Tcp);
    lp.bind(server, "127.0.0.1:0".parse().unwrap()).unwrap();
    let connections = Rc::new(Cell::new(0));
    let connections_ = connections.clone();
    lp.listen(server, None, move |_, _| {
      connections_.set(connections_.get() + 1);
      Ok(())
    })
    .unwrap();
    let addr = lp.local_addr(server).unwrap();

    let mut peers = vec![];
    for _ in 0..5 {
      peers.push(tokio::net::TcpStream::connect(addr).await.unwrap());
    }
    let idle =
      tokio::time::timeout(Duration::from_millis(200), lp.run_event_loop())
        .await;
    assert!(idle.is_err(), "listening loop should stay alive");
    assert_eq!(connections.get(), 1);

    let client = lp.new_handle(HandleKind::Tcp);
    lp.accept(server, client).unwrap();
    assert!(matches!(
      lp.accept(server, lp.new_handle(HandleKind::Tcp)),
      Err(StreamError::Accept(_))
    ));

    let idle =
      tokio::time::timeout(Duration::from_millis(200), lp.run_event_loop())
        .await;
    assert!(idle.is_err());
    assert_eq!(connections.get(), 2);
    drop(peers);
  }

  #[tokio::test]
  async fn tcp_connect_within_one_loop() {
    let lp = StreamLoop::new(TcpSubstrate::new(), LoopOptions::default());
    let server = lp.new_handle(HandleKind::Tcp);
    lp.bind(server, "127.0.0.1:0".parse().unwrap()).unwrap();
    serve_echo(&lp, server);
    let addr = lp.local_addr(server).unwrap();

    let received = Rc::new(RefCell::new(vec![]));
    let client = lp.new_handle(HandleKind::Tcp);
    lp.on(client, EventName::Connect, move |lp, _| {
      lp.write(client, "hello", |_, _| {})?;
      lp.shutdown(client, |_, result| assert!(result.is_ok()))?;
      lp.read_start(client)?;
      Ok(())
    })
    .unwrap();
    let received_ = received.clone();
    lp.on(client, EventName::Data, move |_, event| {
      if let StreamEvent::Data { view, .. } = event {
        received_.borrow_mut().extend_from_slice(view);
      }
      Ok(())
    })
    .unwrap();
    lp.on(client, EventName::End, move |lp, _| {
      lp.close(client, |_, _| {})?;
      lp.close(server, |_, _| {})?;
      Ok(())
    })
    .unwrap();
    lp.connect(client, addr).unwrap();

    tokio::time::timeout(Duration::from_secs(10), lp.run_event_loop())
      .await
      .expect("loop timed out")
      .unwrap();
    assert_eq!(*received.borrow(), b"hello".to_vec());
    assert_eq!(lp.handle_count(), 0);
  }
}
