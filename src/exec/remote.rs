use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    os::fd::AsFd,
    path::Path,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
};
use ssh2::{BlockDirections, Channel, ErrorCode, Session};

use super::{Exit, FileSink, FileStat, Process, Runner, StreamHandle};
use crate::{
    config::{Auth, RemoteTarget},
    error::{Error, Result},
    utils::{
        cancel::{CancelGuard, CancelToken},
        process::CmdSpec,
    },
};

const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Upper bound for one socket wait; the pump re-polls both streams after it.
const PARK_MS: u16 = 200;

/// Runs every command in its own exec channel of one shared ssh session.
///
/// The session is opened on first use, switched to non-blocking mode once
/// authenticated and reused until `close`.
pub struct SshRunner {
    target: RemoteTarget,
    cancel: CancelToken,
    live: Mutex<Option<Live>>,
}

struct Live {
    waiter: Waiter,
    _shutdown: CancelGuard,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SshRunner {
    pub fn new(target: RemoteTarget, cancel: CancelToken) -> Self {
        Self {
            target,
            cancel,
            live: Mutex::new(None),
        }
    }

    fn waiter(&self) -> Result<Waiter> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                program: "ssh".into(),
                diagnostic: String::new(),
            });
        }
        let mut live = lock(&self.live);
        if let Some(l) = live.as_ref() {
            return Ok(l.waiter.clone());
        }
        let l = self.dial()?;
        let waiter = l.waiter.clone();
        *live = Some(l);
        Ok(waiter)
    }

    fn dial(&self) -> Result<Live> {
        let t = &self.target;
        let tcp = TcpStream::connect((t.host.as_str(), t.port))
            .map_err(|e| Error::io(format!("connect {}:{}", t.host, t.port), e))?;
        let hook_tcp = tcp
            .try_clone()
            .map_err(|e| Error::io("clone ssh socket", e))?;
        let poll_tcp = tcp
            .try_clone()
            .map_err(|e| Error::io("clone ssh socket", e))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::session(format!("handshake with {}: {e}", t.host)))?;
        tracing::warn!(
            "ssh host key of {} is not verified; trust the network path to this host",
            t.host
        );

        match &t.auth {
            Auth::Password(pw) => session.userauth_password(&t.username, pw),
            Auth::Identity(key) => session.userauth_pubkey_file(&t.username, None, key, None),
        }
        .map_err(|e| Error::session(format!("authenticate {}@{}: {e}", t.username, t.host)))?;
        if !session.authenticated() {
            return Err(Error::session(format!(
                "authentication as {}@{} was not accepted",
                t.username, t.host
            )));
        }
        tracing::info!("ssh session to {}@{}:{} established", t.username, t.host, t.port);
        session.set_blocking(false);

        // Shutting the socket down fails every pending channel read.
        let shutdown = self.cancel.on_cancel(move || {
            let _ = hook_tcp.shutdown(Shutdown::Both);
        });
        Ok(Live {
            waiter: Waiter {
                session,
                socket: Arc::new(poll_tcp),
            },
            _shutdown: shutdown,
        })
    }

    fn exec(&self, command: &str) -> Result<(Channel, Waiter)> {
        let waiter = self.waiter()?;
        let mut channel = waiter.retry(|| waiter.session.channel_session())?;
        waiter.retry(|| channel.exec(command))?;
        Ok((channel, waiter))
    }
}

/// Non-blocking session plus the socket it runs on. Calls that would
/// block park on the socket and are repeated.
#[derive(Clone)]
struct Waiter {
    session: Session,
    socket: Arc<TcpStream>,
}

impl Waiter {
    fn park(&self) -> io::Result<()> {
        let flags = match self.session.block_directions() {
            BlockDirections::Outbound => PollFlags::POLLOUT,
            BlockDirections::Both => PollFlags::POLLIN | PollFlags::POLLOUT,
            BlockDirections::Inbound | BlockDirections::None => PollFlags::POLLIN,
        };
        let mut fds = [PollFd::new(self.socket.as_fd(), flags)];
        match poll(&mut fds, PollTimeout::from(PARK_MS)) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn retry<T>(&self, mut call: impl FnMut() -> std::result::Result<T, ssh2::Error>) -> Result<T> {
        loop {
            match call() {
                Err(e) if matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN)) => self
                    .park()
                    .map_err(|e| Error::io("wait for ssh socket", e))?,
                done => return Ok(done?),
            }
        }
    }

    fn retry_io<T>(&self, mut call: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        loop {
            match call() {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.park()?,
                done => return done,
            }
        }
    }
}

/// Both output streams of one exec channel.
trait Pipes: Send {
    fn stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Blocks until the transport may have more to deliver.
    fn park(&mut self) -> io::Result<()>;
}

struct SshPipes {
    stdout: ssh2::Stream,
    stderr: ssh2::Stream,
    waiter: Waiter,
}

impl Pipes for SshPipes {
    fn stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }

    fn stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stderr.read(buf)
    }

    fn park(&mut self) -> io::Result<()> {
        self.waiter.park()
    }
}

/// Moves stderr into a buffer every time stdout has nothing to give, so
/// diagnostics never fill the channel window while stdout is waited on.
struct Pump<P> {
    pipes: P,
    diagnostic: Vec<u8>,
    stderr_eof: bool,
    finished: bool,
}

impl<P: Pipes> Pump<P> {
    fn new(pipes: P) -> Self {
        Self {
            pipes,
            diagnostic: Vec::new(),
            stderr_eof: false,
            finished: false,
        }
    }

    /// Takes whatever stderr has pending without waiting. Returns the number
    /// of bytes moved.
    fn drain_stderr(&mut self) -> io::Result<usize> {
        let mut buf = [0u8; 8192];
        let mut moved = 0;
        while !self.stderr_eof {
            match self.pipes.stderr(&mut buf) {
                Ok(0) => self.stderr_eof = true,
                Ok(n) => {
                    self.diagnostic.extend_from_slice(&buf[..n]);
                    moved += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(moved)
    }

    fn drain_to_end(&mut self) -> io::Result<()> {
        while !self.stderr_eof {
            if self.drain_stderr()? == 0 && !self.stderr_eof {
                self.pipes.park()?;
            }
        }
        Ok(())
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.pipes.stdout(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                done => return done,
            }
            if self.drain_stderr()? == 0 {
                self.pipes.park()?;
            }
        }
    }
}

struct Shared<P> {
    pump: Mutex<Pump<P>>,
    done: Condvar,
}

impl<P: Pipes> Shared<P> {
    fn new(pipes: P) -> Arc<Self> {
        Arc::new(Self {
            pump: Mutex::new(Pump::new(pipes)),
            done: Condvar::new(),
        })
    }

    fn finish(&self) {
        lock(&self.pump).finished = true;
        self.done.notify_all();
    }
}

struct ChannelStdout<P> {
    shared: Arc<Shared<P>>,
}

impl<P: Pipes> Read for ChannelStdout<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        lock(&self.shared.pump).read_stdout(buf)
    }
}

/// Hands out the buffered stderr once the process has been reaped.
struct ChannelStderr<P> {
    shared: Arc<Shared<P>>,
}

impl<P: Pipes> Read for ChannelStderr<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pump = lock(&self.shared.pump);
        while !pump.finished {
            pump = self
                .shared
                .done
                .wait(pump)
                .unwrap_or_else(|e| e.into_inner());
        }
        let n = buf.len().min(pump.diagnostic.len());
        buf[..n].copy_from_slice(&pump.diagnostic[..n]);
        pump.diagnostic.drain(..n);
        Ok(n)
    }
}

struct RemoteProcess {
    channel: Channel,
    waiter: Waiter,
    shared: Arc<Shared<SshPipes>>,
    closed: bool,
}

impl RemoteProcess {
    fn close_once(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.waiter
            .retry_io(|| self.channel.close().map_err(io::Error::from))
    }

    fn reap(&mut self) -> io::Result<Exit> {
        if !self.channel.eof() {
            self.close_once()?;
            return Ok(Exit::terminated("channel closed before end of stream"));
        }
        lock(&self.shared.pump).drain_to_end()?;
        self.waiter
            .retry_io(|| self.channel.wait_close().map_err(io::Error::from))?;
        self.closed = true;
        if let Ok(sig) = self.channel.exit_signal()
            && let Some(name) = sig.exit_signal
        {
            return Ok(Exit::terminated(format!("killed by signal {name}")));
        }
        let code = self.channel.exit_status().map_err(io::Error::other)?;
        Ok(Exit::code(code))
    }
}

impl Process for RemoteProcess {
    fn wait(&mut self) -> io::Result<Exit> {
        let reaped = self.reap();
        self.shared.finish();
        reaped
    }

    fn abort(&mut self) -> io::Result<()> {
        let closed = self.close_once();
        self.shared.finish();
        closed
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        self.shared.finish();
    }
}

fn read_command(path: &Path) -> CmdSpec {
    CmdSpec::new("cat").arg("--").arg(path.display().to_string())
}

fn write_command(path: &Path) -> String {
    CmdSpec::new("cat").render_redirect(&path.display().to_string())
}

fn stat_command(path: &Path) -> CmdSpec {
    CmdSpec::new("stat")
        .args(["-c", "%s %Y", "--"])
        .arg(path.display().to_string())
}

fn remove_command(path: &Path) -> CmdSpec {
    CmdSpec::new("rm").arg("--").arg(path.display().to_string())
}

impl Runner for SshRunner {
    fn open_stream(&self, cmd: &CmdSpec) -> Result<StreamHandle> {
        let rendered = cmd.render();
        tracing::debug!("exec on {}: {rendered}", self.target.host);
        let (channel, waiter) = self.exec(&rendered)?;

        let shared = Shared::new(SshPipes {
            stdout: channel.stream(0),
            stderr: channel.stderr(),
            waiter: waiter.clone(),
        });
        StreamHandle::new(
            cmd.program(),
            Box::new(ChannelStdout {
                shared: shared.clone(),
            }),
            Box::new(ChannelStderr {
                shared: shared.clone(),
            }),
            Box::new(RemoteProcess {
                channel,
                waiter,
                shared,
                closed: false,
            }),
            self.cancel.clone(),
            None,
        )
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.open_stream(&read_command(path))?))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn FileSink>> {
        let command = write_command(path);
        tracing::debug!("exec on {}: {command}", self.target.host);
        let (channel, waiter) = self.exec(&command)?;
        Ok(Box::new(RemoteFile {
            channel,
            waiter,
            target: path.display().to_string(),
        }))
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let out = self.run(&stat_command(path))?;
        parse_stat(&out.stdout)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.run(&remove_command(path))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(l) = lock(&self.live).take() {
            let w = &l.waiter;
            w.retry(|| w.session.disconnect(None, "done", None))?;
            tracing::debug!("ssh session to {} closed", self.target.host);
        }
        Ok(())
    }
}

/// `cat > path` on the remote host, fed through the channel's stdin.
struct RemoteFile {
    channel: Channel,
    waiter: Waiter,
    target: String,
}

impl Write for RemoteFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.waiter.retry_io(|| self.channel.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.waiter.retry_io(|| self.channel.flush())
    }
}

impl FileSink for RemoteFile {
    fn finish(self: Box<Self>) -> Result<()> {
        let RemoteFile {
            mut channel,
            waiter,
            target,
        } = *self;
        let ctx = |what: &str| format!("{what} {target}");

        waiter
            .retry_io(|| channel.flush())
            .map_err(|e| Error::io(ctx("flush"), e))?;
        waiter.retry(|| channel.send_eof())?;
        waiter.retry(|| channel.wait_eof())?;
        let mut diagnostic = Vec::new();
        let mut stderr = channel.stderr();
        let _ = waiter.retry_io(|| stderr.read_to_end(&mut diagnostic));
        waiter.retry(|| channel.wait_close())?;

        let code = channel.exit_status()?;
        if code != 0 {
            return Err(Error::Command {
                program: "cat".into(),
                status: Exit::code(code).to_string(),
                diagnostic: String::from_utf8_lossy(&diagnostic).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn parse_stat(stdout: &str) -> Result<FileStat> {
    let mut it = stdout.split_whitespace();
    let (Some(size), Some(mtime)) = (it.next(), it.next()) else {
        return Err(Error::Parse(format!("unexpected stat output: {:?}", stdout.trim())));
    };
    let size = size
        .parse::<u64>()
        .map_err(|e| Error::Parse(format!("stat size {size:?}: {e}")))?;
    let modified = mtime
        .parse::<u64>()
        .ok()
        .map(|s| SystemTime::UNIX_EPOCH + Duration::from_secs(s));
    Ok(FileStat { size, modified })
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, thread};

    use super::*;

    /// Stdout stays blocked while stderr still has queued chunks, like a
    /// channel whose window is full of diagnostics.
    struct WindowedPipes {
        stdout: VecDeque<u8>,
        stderr: VecDeque<Vec<u8>>,
        parks: usize,
    }

    impl WindowedPipes {
        fn new(stdout: &[u8], stderr: &[&str]) -> Self {
            Self {
                stdout: stdout.iter().copied().collect(),
                stderr: stderr.iter().map(|s| s.as_bytes().to_vec()).collect(),
                parks: 0,
            }
        }
    }

    impl Pipes for WindowedPipes {
        fn stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.stderr.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.stdout.len());
            for (slot, b) in buf.iter_mut().zip(self.stdout.drain(..n)) {
                *slot = b;
            }
            Ok(n)
        }

        fn stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.stderr.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.stdout.is_empty() => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn park(&mut self) -> io::Result<()> {
            self.parks += 1;
            if self.parks > 100 {
                return Err(io::Error::other("transport stalled"));
            }
            Ok(())
        }
    }

    #[test]
    fn stdout_progresses_while_stderr_is_pending() {
        let shared = Shared::new(WindowedPipes::new(
            b"archive bytes",
            &["INFO: starting\n", "INFO: 50%\n", "INFO: done\n"],
        ));
        let mut stdout = ChannelStdout {
            shared: shared.clone(),
        };
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"archive bytes");

        lock(&shared.pump).drain_to_end().unwrap();
        shared.finish();
        let mut text = String::new();
        ChannelStderr { shared }.read_to_string(&mut text).unwrap();
        assert_eq!(text, "INFO: starting\nINFO: 50%\nINFO: done\n");
    }

    #[test]
    fn stderr_reader_waits_for_the_process_to_finish() {
        let shared = Shared::new(WindowedPipes::new(b"", &["ERROR: boom"]));
        let mut stderr = ChannelStderr {
            shared: shared.clone(),
        };
        let drain = thread::spawn(move || {
            let mut s = String::new();
            stderr.read_to_string(&mut s).unwrap();
            s
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!drain.is_finished());

        lock(&shared.pump).drain_to_end().unwrap();
        shared.finish();
        assert_eq!(drain.join().unwrap(), "ERROR: boom");
    }

    #[test]
    fn remote_file_commands() {
        let p = Path::new("/var/lib/vz/dump/vzdump-qemu-101-2026_01_02-03_04_05.vma.zst");
        assert_eq!(
            read_command(p).render(),
            "cat -- /var/lib/vz/dump/vzdump-qemu-101-2026_01_02-03_04_05.vma.zst"
        );
        assert_eq!(
            stat_command(p).render(),
            "stat -c '%s %Y' -- /var/lib/vz/dump/vzdump-qemu-101-2026_01_02-03_04_05.vma.zst"
        );
        assert_eq!(
            remove_command(p).render(),
            "rm -- /var/lib/vz/dump/vzdump-qemu-101-2026_01_02-03_04_05.vma.zst"
        );

        let odd = Path::new("/tmp/it's here.tar");
        assert_eq!(write_command(odd), r"cat > '/tmp/it'\''s here.tar'");
        assert_eq!(read_command(odd).render(), r"cat -- '/tmp/it'\''s here.tar'");
    }

    #[test]
    fn parse_stat_size_and_mtime() {
        let st = parse_stat("1048576 1700000000\n").unwrap();
        assert_eq!(st.size, 1_048_576);
        assert_eq!(
            st.modified,
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );
    }

    #[test]
    fn parse_stat_rejects_garbage() {
        assert!(matches!(parse_stat(""), Err(Error::Parse(_))));
        assert!(matches!(parse_stat("big 1"), Err(Error::Parse(_))));
    }
}
