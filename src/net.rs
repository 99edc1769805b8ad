// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The `NetContext` collaborator: an abstraction over a reactor that bridges and their
//! embedders can drive connections through without owning a poll loop themselves.
//!
//! `MioNetContext` is the reference implementation: one `mio::Poll` thread owns every
//! registered source, and `enqueue`/`destroy` calls from other threads are marshalled onto it
//! through a command channel woken by a `mio::Waker`, so `destroy(conn)` is synchronous with
//! respect to in-flight callbacks regardless of which thread calls it.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd};

use crate::error::{other_io_error, ErrorCallback};

/// A pre-existing OS handle an embedder wants the reactor to take over, for `connect_special`.
pub enum Special {
    /// The process's standard input, as an anonymous-pipe read end.
    Stdin,
    /// The process's standard output, as an anonymous-pipe write end.
    Stdout,
    /// A raw file/socket descriptor already connected, e.g. inherited across a `fork`/`exec`
    /// boundary or handed down by a supervisor.
    Descriptor(std::os::raw::c_int),
}

/// Opaque handle to a registered connection or server socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(usize);

/// Opaque handle to an armed timeout, returned by `set_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutToken(usize);

const WAKE_TOKEN: Token = Token(usize::MAX);

thread_local! {
    static ON_POLL_THREAD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Callbacks the context drives on whichever thread owns the poll loop.
pub trait NetCallbacks: Send + Sync {
    /// The connection can accept more bytes via `send` again after previously returning 0.
    fn clear_to_send(&self, conn: ConnHandle);
    /// `data` empty means EOF / disconnect.
    fn receive_complete(&self, conn: ConnHandle, data: &[u8]);
    /// A server socket accepted `accepted`, connected to `peer_addr`.
    fn on_accept(&self, conn: ConnHandle, accepted: ConnHandle, peer_addr: String);
    fn on_timeout(&self, conn: ConnHandle, timeout: TimeoutToken);
}

/// Contract exposed to bridges and other embedders.
pub trait NetContext: Send + Sync {
    fn connect(&self, addr: &str, callbacks: Arc<dyn NetCallbacks>) -> io::Result<ConnHandle>;
    fn create_server(&self, addr: &str, callbacks: Arc<dyn NetCallbacks>) -> io::Result<ConnHandle>;
    /// Hands a pre-existing handle (inherited stdio, a descriptor passed down by a supervisor)
    /// to the reactor in place of dialing a new connection.
    fn connect_special(&self, which: Special, callbacks: Arc<dyn NetCallbacks>) -> io::Result<ConnHandle>;
    /// Creates an anonymous local pipe. Bytes written via `send(write, ..)` arrive as
    /// `receive_complete` callbacks on `read`.
    fn create_pipe(&self, callbacks: Arc<dyn NetCallbacks>) -> io::Result<(ConnHandle, ConnHandle)>;
    fn accept(&self, server: ConnHandle) -> io::Result<()>;
    fn receive(&self, conn: ConnHandle) -> io::Result<()>;
    /// Returns the number of bytes accepted; 0 means backpressure (wait for `clear_to_send`)
    /// or a disconnected peer — the caller distinguishes the two via whether it previously
    /// saw `clear_to_send` for this connection.
    fn send(&self, conn: ConnHandle, data: &[u8]) -> io::Result<usize>;
    fn ready_to_send(&self, conn: ConnHandle) -> bool;
    fn destroy(&self, conn: ConnHandle);
    fn set_timeout(&self, conn: ConnHandle, delay: Duration) -> TimeoutToken;
    fn clear_timeout(&self, timeout: TimeoutToken);
    /// Runs `action` on the poll thread, ordered with respect to I/O callbacks.
    fn enqueue(&self, action: Box<dyn FnOnce() + Send>);
}

enum Source {
    Stream(TcpStream),
    Listener(TcpListener),
    #[cfg(unix)]
    PipeRead(mio::unix::pipe::Receiver),
    #[cfg(unix)]
    PipeWrite(mio::unix::pipe::Sender),
}

struct Registered {
    source: Source,
    callbacks: Arc<dyn NetCallbacks>,
    writable: bool,
}

struct Timer {
    conn: ConnHandle,
    token: TimeoutToken,
    at: Instant,
}

enum Command {
    Register { conn: ConnHandle, source: Source, interest: Interest, callbacks: Arc<dyn NetCallbacks> },
    Deregister(ConnHandle),
    SetTimeout(ConnHandle, TimeoutToken, Duration),
    ClearTimeout(TimeoutToken),
    Write(ConnHandle, Vec<u8>, std::sync::mpsc::Sender<io::Result<usize>>),
    Run(Box<dyn FnOnce() + Send>),
}

/// `mio`-backed reference `NetContext`. One background thread runs the poll loop for the
/// lifetime of this value.
pub struct MioNetContext {
    next_id: AtomicUsize,
    commands: Mutex<Vec<Command>>,
    waker: Arc<Waker>,
    error_cb: Arc<dyn ErrorCallback>,
}

impl MioNetContext {
    pub fn spawn(error_cb: Arc<dyn ErrorCallback>) -> io::Result<Arc<MioNetContext>> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let ctx = Arc::new(MioNetContext {
            next_id: AtomicUsize::new(1),
            commands: Mutex::new(Vec::new()),
            waker,
            error_cb,
        });

        let worker = ctx.clone();
        thread::spawn(move || worker.run(poll));

        Ok(ctx)
    }

    fn next_handle(&self) -> ConnHandle {
        ConnHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn next_timeout(&self) -> TimeoutToken {
        TimeoutToken(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn push(&self, cmd: Command) {
        self.commands.lock().expect("net context command lock poisoned").push(cmd);
        let _ = self.waker.wake();
    }

    fn run(&self, mut poll: Poll) {
        ON_POLL_THREAD.with(|flag| flag.set(true));
        let mut events = Events::with_capacity(256);
        let mut conns: HashMap<usize, Registered> = HashMap::new();
        let mut timers: Vec<Timer> = Vec::new();

        loop {
            let timeout = timers.iter().map(|t| t.at).min().map(|at| at.saturating_duration_since(Instant::now()));
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.error_cb.on_error("poll", "net::MioNetContext::run", &e);
                return;
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let id = event.token().0;
                let mut disconnect = false;
                let mut new_conns: Vec<(usize, Registered)> = Vec::new();
                if let Some(reg) = conns.get_mut(&id) {
                    if event.is_writable() {
                        reg.writable = true;
                        reg.callbacks.clear_to_send(ConnHandle(id));
                    }
                    if event.is_readable() {
                        match &mut reg.source {
                            Source::Stream(stream) => {
                                let mut buf = [0u8; 4096];
                                match stream.read(&mut buf) {
                                    Ok(0) => {
                                        reg.callbacks.receive_complete(ConnHandle(id), &[]);
                                        disconnect = true;
                                    }
                                    Ok(n) => reg.callbacks.receive_complete(ConnHandle(id), &buf[..n]),
                                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                                    Err(_) => {
                                        reg.callbacks.receive_complete(ConnHandle(id), &[]);
                                        disconnect = true;
                                    }
                                }
                            }
                            #[cfg(unix)]
                            Source::PipeRead(pipe) => {
                                let mut buf = [0u8; 4096];
                                match pipe.read(&mut buf) {
                                    Ok(0) => {
                                        reg.callbacks.receive_complete(ConnHandle(id), &[]);
                                        disconnect = true;
                                    }
                                    Ok(n) => reg.callbacks.receive_complete(ConnHandle(id), &buf[..n]),
                                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                                    Err(_) => {
                                        reg.callbacks.receive_complete(ConnHandle(id), &[]);
                                        disconnect = true;
                                    }
                                }
                            }
                            #[cfg(unix)]
                            Source::PipeWrite(_) => {}
                            Source::Listener(listener) => loop {
                                match listener.accept() {
                                    Ok((mut stream, addr)) => {
                                        let accepted = ConnHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
                                        let interest = Interest::READABLE | Interest::WRITABLE;
                                        if poll.registry().register(&mut stream, Token(accepted.0), interest).is_ok() {
                                            let cb = reg.callbacks.clone();
                                            cb.on_accept(ConnHandle(id), accepted, addr.to_string());
                                            new_conns.push((
                                                accepted.0,
                                                Registered { source: Source::Stream(stream), callbacks: cb, writable: true },
                                            ));
                                        }
                                    }
                                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                    Err(e) => {
                                        self.error_cb.on_error("accept", "net::MioNetContext::run", &e);
                                        break;
                                    }
                                }
                            },
                        }
                    }
                }
                for (new_id, new_reg) in new_conns {
                    conns.insert(new_id, new_reg);
                }
                if disconnect {
                    if let Some(mut reg) = conns.remove(&id) {
                        let _ = deregister(&poll, &mut reg.source);
                    }
                }
            }

            let now = Instant::now();
            let (due, pending): (Vec<_>, Vec<_>) = timers.into_iter().partition(|t| t.at <= now);
            timers = pending;
            for t in due {
                if let Some(reg) = conns.get(&t.conn.0) {
                    reg.callbacks.on_timeout(t.conn, t.token);
                }
            }

            let drained: Vec<Command> = std::mem::take(&mut *self.commands.lock().expect("net context command lock poisoned"));
            for cmd in drained {
                match cmd {
                    Command::Register { conn, mut source, interest, callbacks } => {
                        let reg_result = match &mut source {
                            Source::Stream(s) => poll.registry().register(s, Token(conn.0), interest),
                            Source::Listener(l) => poll.registry().register(l, Token(conn.0), interest),
                            #[cfg(unix)]
                            Source::PipeRead(p) => poll.registry().register(p, Token(conn.0), interest),
                            #[cfg(unix)]
                            Source::PipeWrite(p) => poll.registry().register(p, Token(conn.0), interest),
                        };
                        if let Err(e) = reg_result {
                            self.error_cb.on_error("register", "net::MioNetContext::run", &e);
                            continue;
                        }
                        conns.insert(conn.0, Registered { source, callbacks, writable: true });
                    }
                    Command::Deregister(conn) => {
                        if let Some(mut reg) = conns.remove(&conn.0) {
                            let _ = deregister(&poll, &mut reg.source);
                        }
                        timers.retain(|t| t.conn != conn);
                    }
                    Command::SetTimeout(conn, token, delay) => {
                        timers.push(Timer { conn, token, at: Instant::now() + delay });
                    }
                    Command::ClearTimeout(token) => {
                        timers.retain(|t| t.token != token);
                    }
                    Command::Write(conn, data, reply) => {
                        fn write_to(writable: &mut bool, data: &[u8], w: &mut impl Write) -> io::Result<usize> {
                            if !*writable {
                                return Ok(0);
                            }
                            match w.write(data) {
                                Ok(n) => {
                                    if n < data.len() {
                                        *writable = false;
                                    }
                                    Ok(n)
                                }
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                    *writable = false;
                                    Ok(0)
                                }
                                Err(e) => Err(e),
                            }
                        }
                        let result = match conns.get_mut(&conn.0) {
                            Some(Registered { source: Source::Stream(stream), writable, .. }) => {
                                write_to(writable, &data, stream)
                            }
                            #[cfg(unix)]
                            Some(Registered { source: Source::PipeWrite(pipe), writable, .. }) => {
                                write_to(writable, &data, pipe)
                            }
                            Some(Registered { source: Source::Listener(_), .. }) => {
                                Err(other_io_error("cannot write to a listening socket"))
                            }
                            #[cfg(unix)]
                            Some(Registered { source: Source::PipeRead(_), .. }) => {
                                Err(other_io_error("cannot write to a pipe's read end"))
                            }
                            None => Ok(0),
                        };
                        let _ = reply.send(result);
                    }
                    Command::Run(action) => action(),
                }
            }
        }
    }
}

fn deregister(poll: &Poll, source: &mut Source) -> io::Result<()> {
    match source {
        Source::Stream(s) => poll.registry().deregister(s),
        Source::Listener(l) => poll.registry().deregister(l),
        #[cfg(unix)]
        Source::PipeRead(p) => poll.registry().deregister(p),
        #[cfg(unix)]
        Source::PipeWrite(p) => poll.registry().deregister(p),
    }
}

impl NetContext for MioNetContext {
    fn connect(&self, addr: &str, callbacks: Arc<dyn NetCallbacks>) -> io::Result<ConnHandle> {
        let sockaddr: SocketAddr = addr.parse().map_err(|_| other_io_error("invalid address"))?;
        let stream = TcpStream::connect(sockaddr)?;
        let conn = self.next_handle();
        self.push(Command::Register {
            conn,
            source: Source::Stream(stream),
            interest: Interest::READABLE | Interest::WRITABLE,
            callbacks,
        });
        Ok(conn)
    }

    fn create_server(&self, addr: &str, callbacks: Arc<dyn NetCallbacks>) -> io::Result<ConnHandle> {
        let sockaddr: SocketAddr = addr.parse().map_err(|_| other_io_error("invalid address"))?;
        let listener = TcpListener::bind(sockaddr)?;
        let conn = self.next_handle();
        self.push(Command::Register { conn, source: Source::Listener(listener), interest: Interest::READABLE, callbacks });
        Ok(conn)
    }

    #[cfg(unix)]
    fn connect_special(&self, which: Special, callbacks: Arc<dyn NetCallbacks>) -> io::Result<ConnHandle> {
        let (source, interest) = match which {
            Special::Stdin => {
                let pipe = unsafe { mio::unix::pipe::Receiver::from_raw_fd(io::stdin().as_raw_fd()) };
                (Source::PipeRead(pipe), Interest::READABLE)
            }
            Special::Stdout => {
                let pipe = unsafe { mio::unix::pipe::Sender::from_raw_fd(io::stdout().as_raw_fd()) };
                (Source::PipeWrite(pipe), Interest::WRITABLE)
            }
            Special::Descriptor(fd) => {
                let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
                std_stream.set_nonblocking(true)?;
                (Source::Stream(TcpStream::from_std(std_stream)), Interest::READABLE | Interest::WRITABLE)
            }
        };
        let conn = self.next_handle();
        self.push(Command::Register { conn, source, interest, callbacks });
        Ok(conn)
    }

    #[cfg(not(unix))]
    fn connect_special(&self, _which: Special, _callbacks: Arc<dyn NetCallbacks>) -> io::Result<ConnHandle> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "connect_special is only implemented on unix"))
    }

    #[cfg(unix)]
    fn create_pipe(&self, callbacks: Arc<dyn NetCallbacks>) -> io::Result<(ConnHandle, ConnHandle)> {
        let (sender, receiver) = mio::unix::pipe::new()?;
        let read = self.next_handle();
        let write = self.next_handle();
        self.push(Command::Register {
            conn: read,
            source: Source::PipeRead(receiver),
            interest: Interest::READABLE,
            callbacks: callbacks.clone(),
        });
        self.push(Command::Register { conn: write, source: Source::PipeWrite(sender), interest: Interest::WRITABLE, callbacks });
        Ok((read, write))
    }

    #[cfg(not(unix))]
    fn create_pipe(&self, _callbacks: Arc<dyn NetCallbacks>) -> io::Result<(ConnHandle, ConnHandle)> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "create_pipe is only implemented on unix"))
    }

    fn accept(&self, _server: ConnHandle) -> io::Result<()> {
        // accepted sockets are announced via `on_accept` as soon as the listener is readable
        Ok(())
    }

    fn receive(&self, _conn: ConnHandle) -> io::Result<()> {
        // reads are pushed via `receive_complete` whenever the registered source is readable
        Ok(())
    }

    fn send(&self, conn: ConnHandle, data: &[u8]) -> io::Result<usize> {
        // Called from the poll thread itself (e.g. from inside a callback): the command queue
        // isn't being drained while we'd wait on it, so there's nothing to marshal to.
        if ON_POLL_THREAD.with(|flag| flag.get()) {
            self.push(Command::Write(conn, data.to_vec(), std::sync::mpsc::channel().0));
            return Ok(0);
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.push(Command::Write(conn, data.to_vec(), tx));
        rx.recv().unwrap_or(Ok(0))
    }

    fn ready_to_send(&self, _conn: ConnHandle) -> bool {
        true
    }

    fn destroy(&self, conn: ConnHandle) {
        if ON_POLL_THREAD.with(|flag| flag.get()) {
            self.push(Command::Deregister(conn));
            return;
        }
        // Waiting on this ack first guarantees any callback already in flight for `conn` has
        // run before we deregister it; waiting on the second guarantees none will run after.
        let (tx, rx) = std::sync::mpsc::channel();
        self.push(Command::Run(Box::new(move || {
            let _ = tx.send(());
        })));
        let _ = rx.recv();

        self.push(Command::Deregister(conn));

        let (tx2, rx2) = std::sync::mpsc::channel();
        self.push(Command::Run(Box::new(move || {
            let _ = tx2.send(());
        })));
        let _ = rx2.recv();
    }

    fn set_timeout(&self, conn: ConnHandle, delay: Duration) -> TimeoutToken {
        let token = self.next_timeout();
        self.push(Command::SetTimeout(conn, token, delay));
        token
    }

    fn clear_timeout(&self, timeout: TimeoutToken) {
        self.push(Command::ClearTimeout(timeout));
    }

    fn enqueue(&self, action: Box<dyn FnOnce() + Send>) {
        self.push(Command::Run(action));
    }
}
