use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// `true` for the error kinds a socket read timeout produces.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// One accepted client socket.
///
/// Reads are done by the handler thread only. Writes may come from the
/// handler and from packetizer threads at the same time; they are
/// serialized by an internal lock so frames never interleave.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    /// Separate handle so timeouts and shutdown never wait on a blocked writer.
    control: TcpStream,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self {
            id: CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(stream),
            control,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Read one line, without its `\r\n` (or bare `\n`) terminator.
    ///
    /// Returns `None` at end of stream when nothing was read.
    pub fn read_line(&self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.reader.lock().read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Read whatever is available, up to `buf.len()` bytes. `0` means EOF.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().read(buf)
    }

    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        self.reader.lock().read_exact(buf)
    }

    /// Read and discard exactly `len` bytes.
    pub fn skip(&self, len: usize) -> io::Result<()> {
        let mut reader = self.reader.lock();
        let copied = io::copy(&mut (&mut *reader).take(len as u64), &mut io::sink())?;
        if copied < len as u64 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Write the whole buffer under the connection's write lock.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()
    }

    /// Write several buffers back to back without another writer in between.
    pub fn write_vectored_all(&self, parts: &[&[u8]]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        for part in parts {
            writer.write_all(part)?;
        }
        writer.flush()
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.control.set_read_timeout(Some(timeout))
    }

    /// Shut the socket down. Safe to call any number of times from any
    /// thread; a blocked reader or writer wakes up with an error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            tracing::trace!(peer = %self.peer_addr, error = %e, "shutdown on a dead socket");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Callbacks driven by the [`Listener`] for every accepted socket.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once, before [`handle`](Self::handle).
    fn on_open(&self, _conn: &Arc<Connection>) {}

    /// Run the request loop. Returning, with or without an error, ends the
    /// connection.
    fn handle(&self, conn: &Arc<Connection>) -> io::Result<()>;

    /// Called exactly once, after the socket has been closed.
    fn on_closed(&self, _conn: &Arc<Connection>) {}
}

/// TCP listener feeding a fixed pool of connection workers.
pub struct Listener {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind and start accepting. Connections beyond `pool_size` wait in
    /// the accept queue until a worker is free.
    pub fn bind<A, H>(addr: A, pool_size: usize, handler: Arc<H>) -> io::Result<Self>
    where
        A: ToSocketAddrs,
        H: ConnectionHandler,
    {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let (tx, rx) = crossbeam_channel::unbounded::<TcpStream>();
        for worker in 0..pool_size.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            thread::Builder::new()
                .name(format!("conn-worker-{worker}"))
                .spawn(move || worker_loop(rx, handler))?;
        }

        let r = running.clone();
        let accept_thread = thread::Builder::new()
            .name("accept".into())
            .spawn(move || accept_loop(listener, tx, r))?;

        tracing::info!(%local_addr, pool_size, "listening");
        Ok(Self {
            local_addr,
            running,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Workers exit once their current connection ends.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`Listener::close`] can terminate it promptly.
fn accept_loop(listener: TcpListener, tx: Sender<TcpStream>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                tracing::debug!(%peer, "accepted");
                if tx.send(stream).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

fn worker_loop<H: ConnectionHandler>(rx: Receiver<TcpStream>, handler: Arc<H>) {
    for stream in rx {
        let conn = match Connection::new(stream) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                tracing::warn!(error = %e, "dropping unusable socket");
                continue;
            }
        };
        let peer = conn.peer_addr();
        tracing::info!(%peer, id = conn.id(), "client connected");

        handler.on_open(&conn);
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&conn))) {
            Ok(Ok(())) => "closed".to_string(),
            Ok(Err(e)) if is_timeout(&e) => "idle timeout".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                tracing::error!(%peer, id = conn.id(), "connection handler panicked");
                "handler panicked".to_string()
            }
        };
        conn.close();
        handler.on_closed(&conn);

        tracing::info!(%peer, id = conn.id(), %reason, "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn read_line_strips_terminators() {
        let (mut client, server) = pair();
        let conn = Connection::new(server).unwrap();
        client.write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\n\r\ntail").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("OPTIONS * RTSP/1.0"));
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("CSeq: 1"));
        assert_eq!(conn.read_line().unwrap().as_deref(), Some(""));
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("tail"));
        assert_eq!(conn.read_line().unwrap(), None);
    }

    #[test]
    fn read_timeout_is_reported() {
        let (_client, server) = pair();
        let conn = Connection::new(server).unwrap();
        conn.set_read_timeout(Duration::from_millis(30)).unwrap();
        let err = conn.read_line().unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn close_is_idempotent_and_wakes_reader() {
        let (_client, server) = pair();
        let conn = Arc::new(Connection::new(server).unwrap());
        let reader = {
            let conn = conn.clone();
            thread::spawn(move || conn.read_line())
        };
        thread::sleep(Duration::from_millis(50));
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        let result = reader.join().unwrap();
        assert!(matches!(result, Ok(None) | Err(_)));
    }

    struct Echo {
        closed: AtomicUsize,
    }

    impl ConnectionHandler for Echo {
        fn handle(&self, conn: &Arc<Connection>) -> io::Result<()> {
            while let Some(line) = conn.read_line()? {
                conn.write_all(format!("{line}\r\n").as_bytes())?;
            }
            Ok(())
        }

        fn on_closed(&self, _conn: &Arc<Connection>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listener_dispatches_and_finalizes_once() {
        let handler = Arc::new(Echo {
            closed: AtomicUsize::new(0),
        });
        let mut listener = Listener::bind("127.0.0.1:0", 2, handler.clone()).unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).unwrap();
        client.write_all(b"ping\r\n").unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "ping\r\n");
        drop(reader);
        client.shutdown(Shutdown::Both).unwrap();

        for _ in 0..100 {
            if handler.closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        listener.close();
    }

    struct PanicOnBang {
        closed: AtomicUsize,
    }

    impl ConnectionHandler for PanicOnBang {
        fn handle(&self, conn: &Arc<Connection>) -> io::Result<()> {
            while let Some(line) = conn.read_line()? {
                if line == "!" {
                    panic!("handler failure");
                }
                conn.write_all(format!("{line}\r\n").as_bytes())?;
            }
            Ok(())
        }

        fn on_closed(&self, _conn: &Arc<Connection>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn handler_panic_keeps_the_worker_alive() {
        let handler = Arc::new(PanicOnBang {
            closed: AtomicUsize::new(0),
        });
        let mut listener = Listener::bind("127.0.0.1:0", 1, handler.clone()).unwrap();

        let mut first = TcpStream::connect(listener.local_addr()).unwrap();
        first.write_all(b"!\r\n").unwrap();
        let mut rest = Vec::new();
        let _ = first.read_to_end(&mut rest);
        assert!(rest.is_empty());

        for _ in 0..100 {
            if handler.closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);

        // The single worker must still be serving.
        let mut second = TcpStream::connect(listener.local_addr()).unwrap();
        second.write_all(b"pong\r\n").unwrap();
        let mut reader = BufReader::new(second.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "pong\r\n");
        second.shutdown(Shutdown::Both).unwrap();
        listener.close();
    }
}
