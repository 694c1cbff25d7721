//! Event loop
//!
//! One thread, one `mio::Poll`. Each iteration accepts connections, drives
//! the ones with socket events, collects bucket reads and expired waits,
//! runs cron once per wall-clock second and acts on pending signals.
//!
//! Shutdown stops accepting, keeps serving open connections for a bounded
//! number of iterations (or until none has work left), then flushes and
//! syncs the binlog.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bayes_engine::BayesStore;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::aio::{BucketLoader, DiskReader};
use crate::config::ServerConfig;
use crate::connection::{ConnStatus, ConnectionTable};
use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::logging::LogFile;
use crate::scheduler::Scheduler;
use crate::signals::Signals;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const READ_CHUNK: usize = 16 * 1024;

fn token_for(id: usize) -> Token {
    Token(id + FIRST_CONNECTION)
}

/// Stops a running server from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    signals: Signals,
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// Ask for a graceful shutdown, as SIGTERM would.
    pub fn shutdown(&self) -> io::Result<()> {
        self.signals.request_terminate();
        self.waker.wake()
    }
}

/// The memcache server.
pub struct Server {
    poll: Poll,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    sockets: FxHashMap<usize, TcpStream>,
    table: ConnectionTable,
    dispatcher: Dispatcher,
    config: ServerConfig,
    signals: Signals,
    log_file: Option<LogFile>,
    last_cron: i64,
}

impl Server {
    /// Bind the listen socket and start the bucket reader.
    pub fn bind(
        config: ServerConfig,
        store: BayesStore,
        signals: Signals,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        if config.lock_memory {
            lock_memory();
        }

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.listen).map_err(|source| ServerError::Bind {
            addr: config.listen,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let loader: Option<Box<dyn BucketLoader>> = match store.index() {
            Some(index) => Some(Box::new(DiskReader::spawn(
                Arc::clone(index),
                config.aio_slots,
                Some(Arc::clone(&waker)),
            )?)),
            None => None,
        };
        let scheduler = Scheduler::new(loader).with_query_timeout(config.query_timeout);
        let mut dispatcher =
            Dispatcher::new(store, scheduler, config.engine.binlog.max_segment_size);
        dispatcher.net_mut().max_connections = config.max_connections as u64;

        info!(target: "bayes::server", addr = %local_addr, "Listening");
        Ok(Server {
            poll,
            listener: Some(listener),
            local_addr,
            waker,
            sockets: FxHashMap::default(),
            table: ConnectionTable::new(config.max_connections),
            dispatcher,
            config,
            signals,
            log_file: None,
            last_cron: chrono::Utc::now().timestamp(),
        })
    }

    /// Reopen `log_file` on SIGUSR1.
    pub fn with_log_file(mut self, log_file: LogFile) -> Self {
        self.log_file = Some(log_file);
        self
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            signals: self.signals.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Serve until shutdown.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(1024);
        let mut drain_steps: Option<u32> = None;

        loop {
            let timeout = self.poll_timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept()?,
                    WAKER => {}
                    Token(token) => self.connection_event(token - FIRST_CONNECTION, event)?,
                }
            }

            let now = Instant::now();
            for id in self
                .dispatcher
                .process_completions(&mut self.table, now)?
            {
                self.pump(id, now)?;
            }
            for id in self.dispatcher.process_timeouts(&mut self.table, now)? {
                self.pump(id, now)?;
            }

            self.cron_if_due()?;
            self.handle_signals()?;

            if drain_steps.is_none() && self.signals.terminate_requested() {
                self.stop_accepting()?;
                drain_steps = Some(self.config.shutdown_steps);
            }
            if let Some(steps) = drain_steps.as_mut() {
                let idle = !self.table.has_work_in_flight() && !self.dispatcher.scheduler().has_in_flight();
                if idle || *steps == 0 {
                    break;
                }
                *steps -= 1;
            }
        }

        for id in self.table.ids() {
            self.close(id);
        }
        self.dispatcher.shutdown()?;
        info!(target: "bayes::server", "Server stopped");
        Ok(())
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        let mut timeout = self.config.poll_interval;
        if let Some(deadline) = self.dispatcher.scheduler().next_timeout() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        timeout
    }

    fn accept(&mut self) -> Result<(), ServerError> {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return Ok(());
            };
            let (mut stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "bayes::server", error = %e, "Accept failed");
                    return Ok(());
                }
            };

            let Some(id) = self.table.insert() else {
                self.dispatcher.net_mut().refused_connections += 1;
                warn!(target: "bayes::server", %peer, "Connection limit reached");
                continue;
            };
            self.poll.registry().register(
                &mut stream,
                token_for(id),
                Interest::READABLE | Interest::WRITABLE,
            )?;
            self.sockets.insert(id, stream);
            let net = self.dispatcher.net_mut();
            net.accepted_connections += 1;
            net.active_connections += 1;
            debug!(target: "bayes::server", conn = id, %peer, "Accepted");
        }
    }

    fn connection_event(&mut self, id: usize, event: &Event) -> Result<(), ServerError> {
        if event.is_readable() && !self.read_in(id) {
            self.close(id);
            return Ok(());
        }
        self.pump(id, Instant::now())
    }

    /// Read everything available. `false` when the peer is gone.
    fn read_in(&mut self, id: usize) -> bool {
        let (Some(conn), Some(stream)) = (self.table.get_mut(id), self.sockets.get_mut(&id))
        else {
            return false;
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => conn.input.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(target: "bayes::server", conn = id, error = %e, "Read failed");
                    return false;
                }
            }
        }
    }

    /// Write queued output. `true` if anything was written.
    fn write_out(&mut self, id: usize) -> bool {
        let (Some(conn), Some(stream)) = (self.table.get_mut(id), self.sockets.get_mut(&id))
        else {
            return false;
        };
        let mut wrote = false;
        while !conn.output.is_empty() {
            match stream.write(&conn.output) {
                Ok(0) => {
                    conn.status = ConnStatus::Closed;
                    break;
                }
                Ok(n) => {
                    conn.output_written(n);
                    wrote = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(target: "bayes::server", conn = id, error = %e, "Write failed");
                    conn.status = ConnStatus::Closed;
                    break;
                }
            }
        }
        wrote
    }

    /// Drive a connection and flush its output until neither makes
    /// progress.
    fn pump(&mut self, id: usize, now: Instant) -> Result<(), ServerError> {
        loop {
            self.dispatcher.drive(&mut self.table, id, now)?;
            let wrote = self.write_out(id);
            let Some(conn) = self.table.get(id) else {
                return Ok(());
            };
            if conn.is_closed() {
                self.close(id);
                return Ok(());
            }
            let more = conn.status == ConnStatus::Reading && !conn.input.is_empty();
            if !(wrote && more) {
                return Ok(());
            }
        }
    }

    fn close(&mut self, id: usize) {
        if let Some(mut stream) = self.sockets.remove(&id) {
            if let Err(e) = self.poll.registry().deregister(&mut stream) {
                debug!(target: "bayes::server", conn = id, error = %e, "Deregister failed");
            }
        }
        if let Some(conn) = self.table.remove(id) {
            self.dispatcher.release(&conn);
            let net = self.dispatcher.net_mut();
            net.active_connections = net.active_connections.saturating_sub(1);
            debug!(target: "bayes::server", conn = id, "Closed");
        }
    }

    fn cron_if_due(&mut self) -> Result<(), ServerError> {
        let now = chrono::Utc::now().timestamp();
        if now != self.last_cron {
            self.last_cron = now;
            self.dispatcher.cron()?;
        }
        Ok(())
    }

    fn handle_signals(&mut self) -> Result<(), ServerError> {
        if self.signals.take_hangup() {
            info!(target: "bayes::server", "SIGHUP: syncing binlog");
            self.dispatcher.sync()?;
        }
        if self.signals.take_user1() {
            if let Some(log_file) = &self.log_file {
                match log_file.reopen() {
                    Ok(()) => info!(target: "bayes::server", path = %log_file.path().display(), "Log reopened"),
                    Err(e) => warn!(target: "bayes::server", error = %e, "Log reopen failed"),
                }
            }
            self.dispatcher.sync()?;
        }
        Ok(())
    }

    fn stop_accepting(&mut self) -> Result<(), ServerError> {
        if let Some(mut listener) = self.listener.take() {
            self.poll.registry().deregister(&mut listener)?;
        }
        info!(
            target: "bayes::server",
            open = self.table.len(),
            steps = self.config.shutdown_steps,
            "Shutting down"
        );
        Ok(())
    }
}

/// Lock current and future pages in memory. Failure is logged only.
fn lock_memory() {
    // SAFETY: mlockall takes only flags and touches no Rust-managed memory.
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        warn!(
            target: "bayes::server",
            error = %io::Error::last_os_error(),
            "mlockall failed"
        );
    }
}
