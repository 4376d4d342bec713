// Copyright 2018-2025 the Deno authors. MIT license.

// TCP substrate on top of tokio's reactor. Sockets are polled directly with
// `poll_accept`/`try_read`/`try_write`; no tasks are spawned, so the loop
// must be driven from inside a tokio runtime.

use super::Completion;
use super::ReadStatus;
use super::Substrate;
use crate::callback_context::RequestId;
use crate::error::UvError;
use crate::handle_table::HandleId;
use crate::stream::HandleKind;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use tokio::net::TcpListener;
use tokio::net::TcpSocket;
use tokio::net::TcpStream;

type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>>>>;

struct WritePending {
  req: RequestId,
  data: Bytes,
  offset: usize,
}

struct ConnectPending {
  req: RequestId,
  future: ConnectFuture,
}

#[derive(Default)]
struct TcpHandle {
  bind_addr: Option<SocketAddr>,
  listener: Option<TcpListener>,
  backlog: VecDeque<TcpStream>,
  stream: Option<TcpStream>,
  connect: Option<ConnectPending>,
  reading: bool,
  write_queue: VecDeque<WritePending>,
  shutdown: Option<RequestId>,
}

#[derive(Default)]
pub struct TcpSubstrate {
  handles: BTreeMap<HandleId, TcpHandle>,
  ready: Vec<Completion>,
}

impl TcpSubstrate {
  pub fn new() -> Self {
    Self::default()
  }

  fn get(&self, handle: HandleId) -> Result<&TcpHandle, UvError> {
    self.handles.get(&handle).ok_or(UvError::EBADF)
  }

  fn get_mut(&mut self, handle: HandleId) -> Result<&mut TcpHandle, UvError> {
    self.handles.get_mut(&handle).ok_or(UvError::EBADF)
  }
}

fn bind_listener(
  addr: SocketAddr,
  backlog: u32,
) -> std::io::Result<TcpListener> {
  let socket = if addr.is_ipv4() {
    TcpSocket::new_v4()?
  } else {
    TcpSocket::new_v6()?
  };
  #[cfg(unix)]
  socket.set_reuseaddr(true)?;
  socket.bind(addr)?;
  socket.listen(backlog)
}

#[cfg(unix)]
fn shutdown_write(stream: &TcpStream) -> Result<(), UvError> {
  use std::os::unix::io::AsRawFd;
  let fd = stream.as_raw_fd();
  // SAFETY: `fd` is owned by `stream`, which outlives this call.
  if unsafe { libc::shutdown(fd, libc::SHUT_WR) } == 0 {
    Ok(())
  } else {
    Err(UvError::from(std::io::Error::last_os_error()))
  }
}

#[cfg(not(unix))]
fn shutdown_write(_stream: &TcpStream) -> Result<(), UvError> {
  Err(UvError::ENOTSUP)
}

/// Writes as much of the queue as the socket takes without blocking.
fn drain_writes(
  cx: &mut Context,
  stream: &TcpStream,
  queue: &mut VecDeque<WritePending>,
  out: &mut Vec<Completion>,
) {
  while let Some(pw) = queue.front_mut() {
    let status = loop {
      if pw.offset >= pw.data.len() {
        break Some(Ok(()));
      }
      match stream.try_write(&pw.data[pw.offset..]) {
        Ok(n) => pw.offset += n,
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
          match stream.poll_write_ready(cx) {
            Poll::Ready(Ok(())) => continue,
            Poll::Ready(Err(e)) => break Some(Err(UvError::from(e))),
            Poll::Pending => break None,
          }
        }
        Err(e) => break Some(Err(UvError::from(e))),
      }
    };
    let Some(status) = status else {
      // Retried once the socket is writable again.
      return;
    };
    if let Some(pw) = queue.pop_front() {
      out.push(Completion::Write {
        req: pw.req,
        status,
      });
    }
  }
}

impl Substrate for TcpSubstrate {
  fn init(&mut self, handle: HandleId, kind: HandleKind) {
    if kind != HandleKind::Tcp {
      log::debug!("tcp substrate: handle {handle} is {kind:?}, ops will fail");
      return;
    }
    self.handles.insert(handle, TcpHandle::default());
  }

  fn open(
    &mut self,
    handle: HandleId,
    stream: std::net::TcpStream,
  ) -> Result<(), UvError> {
    let tcp = self.get_mut(handle)?;
    stream.set_nonblocking(true)?;
    tcp.stream = Some(TcpStream::from_std(stream)?);
    Ok(())
  }

  fn bind(&mut self, handle: HandleId, addr: SocketAddr) -> Result<(), UvError> {
    let tcp = self.get_mut(handle)?;
    if tcp.listener.is_some() || tcp.stream.is_some() {
      return Err(UvError::EINVAL);
    }
    tcp.bind_addr = Some(addr);
    Ok(())
  }

  fn listen(&mut self, handle: HandleId, backlog: u32) -> Result<(), UvError> {
    let tcp = self.get_mut(handle)?;
    let addr = tcp
      .bind_addr
      .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    tcp.listener = Some(bind_listener(addr, backlog)?);
    Ok(())
  }

  fn accept(
    &mut self,
    server: HandleId,
    client: HandleId,
  ) -> Result<(), UvError> {
    // Checked first so a connection is never dropped on a bad client id.
    self.get(client)?;
    let stream = self
      .get_mut(server)?
      .backlog
      .pop_front()
      .ok_or(UvError::EAGAIN)?;
    self.get_mut(client)?.stream = Some(stream);
    Ok(())
  }

  fn read_start(&mut self, handle: HandleId) -> Result<(), UvError> {
    let tcp = self.get_mut(handle)?;
    if tcp.stream.is_none() {
      return Err(UvError::ENOTCONN);
    }
    tcp.reading = true;
    Ok(())
  }

  fn read_stop(&mut self, handle: HandleId) -> Result<(), UvError> {
    self.get_mut(handle)?.reading = false;
    Ok(())
  }

  fn poll_read(
    &mut self,
    cx: &mut Context,
    handle: HandleId,
    buf: &mut [u8],
  ) -> Poll<ReadStatus> {
    let Some(tcp) = self.handles.get(&handle) else {
      return Poll::Ready(ReadStatus::Err(UvError::EBADF));
    };
    let Some(stream) = tcp.stream.as_ref().filter(|_| tcp.reading) else {
      return Poll::Pending;
    };
    loop {
      match stream.try_read(buf) {
        Ok(0) => return Poll::Ready(ReadStatus::Eof),
        Ok(n) => return Poll::Ready(ReadStatus::Data(n)),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
          // Registers interest so the reactor wakes the loop task.
          match stream.poll_read_ready(cx) {
            Poll::Ready(Ok(())) => continue,
            Poll::Ready(Err(e)) => {
              return Poll::Ready(ReadStatus::Err(UvError::from(e)));
            }
            Poll::Pending => return Poll::Pending,
          }
        }
        Err(e) => return Poll::Ready(ReadStatus::Err(UvError::from(e))),
      }
    }
  }

  fn write(
    &mut self,
    req: RequestId,
    handle: HandleId,
    data: Bytes,
  ) -> Result<(), UvError> {
    let tcp = self.get_mut(handle)?;
    if tcp.stream.is_none() {
      return Err(UvError::ENOTCONN);
    }
    tcp.write_queue.push_back(WritePending {
      req,
      data,
      offset: 0,
    });
    Ok(())
  }

  fn shutdown(
    &mut self,
    req: RequestId,
    handle: HandleId,
  ) -> Result<(), UvError> {
    let tcp = self.get_mut(handle)?;
    if tcp.stream.is_none() {
      return Err(UvError::ENOTCONN);
    }
    tcp.shutdown = Some(req);
    Ok(())
  }

  fn connect(
    &mut self,
    req: RequestId,
    handle: HandleId,
    addr: SocketAddr,
  ) -> Result<(), UvError> {
    let tcp = self.get_mut(handle)?;
    if tcp.stream.is_some() || tcp.connect.is_some() {
      return Err(UvError::EINVAL);
    }
    tcp.connect = Some(ConnectPending {
      req,
      future: Box::pin(TcpStream::connect(addr)),
    });
    Ok(())
  }

  fn write_queue_size(&self, handle: HandleId) -> usize {
    self.handles.get(&handle).map_or(0, |tcp| {
      tcp
        .write_queue
        .iter()
        .map(|pw| pw.data.len() - pw.offset)
        .sum()
    })
  }

  fn local_addr(&self, handle: HandleId) -> Result<SocketAddr, UvError> {
    let tcp = self.get(handle)?;
    if let Some(listener) = &tcp.listener {
      return Ok(listener.local_addr()?);
    }
    match &tcp.stream {
      Some(stream) => Ok(stream.local_addr()?),
      None => Err(UvError::ENOTCONN),
    }
  }

  fn close(&mut self, handle: HandleId) {
    let Some(tcp) = self.handles.remove(&handle) else {
      return;
    };
    for pw in tcp.write_queue {
      self.ready.push(Completion::Write {
        req: pw.req,
        status: Err(UvError::ECANCELED),
      });
    }
    if let Some(req) = tcp.shutdown {
      self.ready.push(Completion::Shutdown {
        req,
        status: Err(UvError::ECANCELED),
      });
    }
    if let Some(pending) = tcp.connect {
      self.ready.push(Completion::Connect {
        req: pending.req,
        status: Err(UvError::ECANCELED),
      });
    }
  }

  fn poll_completions(&mut self, cx: &mut Context, out: &mut Vec<Completion>) {
    out.append(&mut self.ready);

    for (&id, tcp) in self.handles.iter_mut() {
      if let Some(pending) = tcp.connect.as_mut()
        && let Poll::Ready(result) = pending.future.as_mut().poll(cx)
      {
        let req = pending.req;
        tcp.connect = None;
        let status = match result {
          Ok(stream) => {
            tcp.stream = Some(stream);
            Ok(())
          }
          Err(err) => Err(UvError::from(err)),
        };
        out.push(Completion::Connect { req, status });
      }

      // A connection the listener has not accepted yet stops the socket from
      // being watched. Further peers wait in the kernel backlog.
      if let Some(listener) = &tcp.listener
        && tcp.backlog.is_empty()
      {
        match listener.poll_accept(cx) {
          Poll::Ready(Ok((stream, peer))) => {
            log::trace!("tcp substrate: handle {id} accepted {peer}");
            tcp.backlog.push_back(stream);
            out.push(Completion::Connection {
              server: id,
              status: Ok(()),
            });
          }
          Poll::Ready(Err(err)) => {
            out.push(Completion::Connection {
              server: id,
              status: Err(UvError::from(err)),
            });
          }
          Poll::Pending => {}
        }
      }

      if let Some(stream) = &tcp.stream {
        drain_writes(cx, stream, &mut tcp.write_queue, out);
        if tcp.write_queue.is_empty()
          && let Some(req) = tcp.shutdown.take()
        {
          out.push(Completion::Shutdown {
            req,
            status: shutdown_write(stream),
          });
        }
      }
    }
  }
}
