//! Connections
//!
//! A connection's lifecycle is one explicit [`ConnStatus`] plus a
//! generation number. The generation changes whenever the connection is
//! handed out or resumed, so a disk completion or timer carrying an older
//! generation can tell it no longer belongs to this request.

use std::time::Instant;

use bayes_engine::Message;

/// Where a connection is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Parsing requests from the input buffer
    Reading,
    /// Suspended until `bucket` is loaded or `deadline` passes
    WaitingOnDisk {
        /// Timeout deadline
        deadline: Instant,
        /// Bucket being read
        bucket: u32,
    },
    /// Responses queued; no new request is parsed until they are flushed
    Writing,
    /// Done; the slot is freed by the owner
    Closed,
}

/// A `get` interrupted by a disk read, to be finished on resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGet {
    /// Keys of the request
    pub keys: Vec<String>,
    /// First key not yet answered
    pub next: usize,
}

/// Per-connection state.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    generation: u64,
    /// Request cycle state
    pub status: ConnStatus,
    /// Bytes received and not yet parsed
    pub input: Vec<u8>,
    /// Bytes queued for the client
    pub output: Vec<u8>,
    /// The message `current_text` stored
    pub message: Message,
    /// Bytes reserved against the memory ceiling for `message`
    pub message_bytes: usize,
    /// Interrupted `get`
    pub pending: Option<PendingGet>,
    /// Resumed by a timeout or failed read: answer without the value
    pub in_timeout: bool,
    /// Payload bytes of a rejected request still to be skipped
    pub discard: usize,
}

impl Connection {
    fn new(id: usize, generation: u64) -> Self {
        Connection {
            id,
            generation,
            status: ConnStatus::Reading,
            input: Vec::new(),
            output: Vec::new(),
            message: Message::new(),
            message_bytes: 0,
            pending: None,
            in_timeout: false,
            discard: 0,
        }
    }

    /// Slot id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the connection waits on a disk read.
    pub fn is_waiting(&self) -> bool {
        matches!(self.status, ConnStatus::WaitingOnDisk { .. })
    }

    /// Whether the connection is done.
    pub fn is_closed(&self) -> bool {
        self.status == ConnStatus::Closed
    }

    /// Account for `n` output bytes handed to the socket.
    pub fn output_written(&mut self, n: usize) {
        self.output.drain(..n.min(self.output.len()));
        if self.output.is_empty() && self.status == ConnStatus::Writing {
            self.status = ConnStatus::Reading;
        }
    }

    /// Take every queued output byte, as if written.
    pub fn take_output(&mut self) -> Vec<u8> {
        let out = std::mem::take(&mut self.output);
        self.output_written(0);
        out
    }

    /// Drop input bytes owed to a rejected payload. Returns whether the
    /// debt is paid.
    pub fn skip_discarded(&mut self) -> bool {
        let n = self.discard.min(self.input.len());
        self.input.drain(..n);
        self.discard -= n;
        self.discard == 0
    }
}

/// Slab of connections with a process-wide generation counter.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
    capacity: usize,
    generation: u64,
    active: usize,
}

impl ConnectionTable {
    /// Table holding at most `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        ConnectionTable {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            generation: 0,
            active: 0,
        }
    }

    /// Fresh generation number.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Allocate a connection; `None` at capacity.
    pub fn insert(&mut self) -> Option<usize> {
        if self.active >= self.capacity {
            return None;
        }
        let generation = self.next_generation();
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[id] = Some(Connection::new(id, generation));
        self.active += 1;
        Some(id)
    }

    /// Free a slot, returning the connection it held.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        let conn = self.slots.get_mut(id)?.take()?;
        self.free.push(id);
        self.active -= 1;
        Some(conn)
    }

    /// Connection in a slot.
    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.slots.get(id)?.as_ref()
    }

    /// Mutable connection in a slot.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Resume a suspended connection under a new generation.
    ///
    /// `failed` marks it in-timeout so the interrupted key is answered
    /// without a value.
    pub fn resume(&mut self, id: usize, failed: bool) -> bool {
        let generation = self.next_generation();
        match self.get_mut(id) {
            Some(conn) if conn.is_waiting() => {
                conn.generation = generation;
                conn.status = ConnStatus::Reading;
                conn.in_timeout |= failed;
                true
            }
            _ => false,
        }
    }

    /// Open connections.
    pub fn len(&self) -> usize {
        self.active
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Maximum open connections.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids of open connections.
    pub fn ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i))
            .collect()
    }

    /// Whether any connection waits on disk or has output queued.
    pub fn has_work_in_flight(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|c| c.is_waiting() || !c.output.is_empty())
    }
}
