//! Correlation of responses to in-flight requests.
//!
//! Each request registers a single-shot slot under its 16-bit ID; the read
//! loop completes the slot when a response with that ID arrives. IDs only
//! need to be unique among requests currently in flight, so a slot is always
//! removed on completion, on timeout, and when the connection closes.
use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel},
    },
    time::Instant,
};

use log::debug;

use super::connection::ConnectionError;

#[derive(Debug)]
struct Slots<T> {
    waiters: HashMap<u16, (u64, SyncSender<T>)>,
    generation: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct PendingRequests<T> {
    name: &'static str,
    slots: Mutex<Slots<T>>,
}

/// A registered request awaiting its response.
#[derive(Debug)]
pub struct Waiter<'a, T> {
    id: u16,
    generation: u64,
    table: &'a PendingRequests<T>,
    receiver: Receiver<T>,
}

impl<T> PendingRequests<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(Slots {
                waiters: HashMap::new(),
                generation: 0,
                closed: false,
            }),
        }
    }

    /// Registers a waiter under a random ID not currently in flight.
    pub fn register(&self) -> Result<Waiter<'_, T>, ConnectionError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(ConnectionError::Closed);
        }
        if slots.waiters.len() > u16::MAX as usize {
            return Err(ConnectionError::IdsExhausted);
        }
        let id = loop {
            let id = rand::random::<u16>();
            if !slots.waiters.contains_key(&id) {
                break id;
            }
        };
        Ok(self.insert(&mut slots, id))
    }

    /// Registers a waiter under a caller-chosen ID.
    pub fn register_id(&self, id: u16) -> Result<Waiter<'_, T>, ConnectionError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(ConnectionError::Closed);
        }
        if slots.waiters.contains_key(&id) {
            return Err(ConnectionError::DuplicateRequestId(id));
        }
        Ok(self.insert(&mut slots, id))
    }

    /// Hands `value` to the waiter registered under `id`. Returns false when
    /// nothing is waiting, e.g. a late response after a timeout.
    pub fn complete(&self, id: u16, value: T) -> bool {
        let Some((_, sender)) = self.lock().waiters.remove(&id) else {
            debug!("no pending {} request with id {id}", self.name);
            return false;
        };
        // The channel has room for exactly one value and only this call sends
        // on it; a failed send means the waiter is already gone.
        sender.try_send(value).is_ok()
    }

    /// Fails every waiter with a closed-connection error and refuses new ones.
    pub fn close(&self) {
        let mut slots = self.lock();
        slots.closed = true;
        let dropped = slots.waiters.len();
        slots.waiters.clear();
        if dropped > 0 {
            debug!("released {dropped} pending {} requests", self.name);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().waiters.len()
    }

    fn insert<'a>(&'a self, slots: &mut Slots<T>, id: u16) -> Waiter<'a, T> {
        let (sender, receiver) = sync_channel(1);
        slots.generation += 1;
        slots.waiters.insert(id, (slots.generation, sender));
        Waiter {
            id,
            generation: slots.generation,
            table: self,
            receiver,
        }
    }

    // Only removes the slot if it still belongs to the same registration; the
    // ID may have been completed and handed to a new request meanwhile.
    fn cancel(&self, id: u16, generation: u64) {
        let mut slots = self.lock();
        if slots.waiters.get(&id).is_some_and(|(g, _)| *g == generation) {
            slots.waiters.remove(&id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        // The table holds no invariant a panicking holder could break halfway.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Waiter<'_, T> {
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Blocks until the response arrives, the connection closes, or
    /// `deadline` passes.
    pub fn wait(self, deadline: Instant) -> Result<T, ConnectionError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(ConnectionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ConnectionError::Closed),
        }
    }
}

impl<T> Drop for Waiter<'_, T> {
    // Abandoning a waiter (timeout, write failure, early return) must free its
    // ID, or a later response reusing it would be misdelivered.
    fn drop(&mut self) {
        self.table.cancel(self.id, self.generation);
    }
}
