//! Outstanding network IO objects.
//!
//! One object per read-notify, write-notify or subscription in flight.
//! An IO appears in the context's IO table and in its channel's IO list
//! simultaneously or not at all. One-shot IOs are consumed by their
//! completion or terminal exception; subscriptions are durable and
//! survive circuit disconnects.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::channel::Cid;
use crate::dbr::Dbr;
use crate::error::CaException;

/// Identifier of one outstanding IO, unique across a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ioid(pub(crate) u32);

impl Ioid {
    /// The raw identifier carried in frame parameters.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Ioid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "io#{}", self.0)
    }
}

/// Completion callback of a write-notify.
pub type WriteCallback = Box<dyn FnOnce(Result<(), CaException>) + Send>;
/// Completion callback of a read or read-notify.
pub type ReadCallback = Box<dyn FnOnce(Result<Dbr, CaException>) + Send>;
/// Update callback of a subscription; called for every sample.
pub type SubscriptionCallback = Box<dyn FnMut(Result<Dbr, CaException>) + Send>;

pub(crate) type SharedSubscriptionCallback = Arc<Mutex<SubscriptionCallback>>;

/// Parameters a subscription is (re-)issued with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubParams {
    pub data_type: u16,
    pub count: u32,
    pub mask: u32,
}

pub(crate) enum IoCallback {
    Write(WriteCallback),
    Read(ReadCallback),
    Subscription(SharedSubscriptionCallback),
}

pub(crate) struct Io {
    pub id: Ioid,
    pub cid: Cid,
    pub callback: IoCallback,
    /// Present exactly for subscriptions.
    pub sub: Option<SubParams>,
}

impl Io {
    pub fn new_write_notify(id: Ioid, cid: Cid, done: WriteCallback) -> Self {
        Self {
            id,
            cid,
            callback: IoCallback::Write(done),
            sub: None,
        }
    }

    pub fn new_read_notify(id: Ioid, cid: Cid, done: ReadCallback) -> Self {
        Self {
            id,
            cid,
            callback: IoCallback::Read(done),
            sub: None,
        }
    }

    pub fn new_subscription(id: Ioid, cid: Cid, params: SubParams, update: SubscriptionCallback) -> Self {
        Self {
            id,
            cid,
            callback: IoCallback::Subscription(Arc::new(Mutex::new(update))),
            sub: Some(params),
        }
    }

    /// The durable/one-shot discriminator.
    pub fn is_subscription(&self) -> bool {
        self.sub.is_some()
    }

    /// Callback handle of a subscription, callable without consuming
    /// the IO.
    pub fn subscription_callback(&self) -> Option<SharedSubscriptionCallback> {
        match &self.callback {
            IoCallback::Subscription(cb) => Some(cb.clone()),
            _ => None,
        }
    }

    /// Deliver a write-notify completion, consuming the IO.
    pub fn complete_write(self) {
        match self.callback {
            IoCallback::Write(done) => done(Ok(())),
            _ => tracing::debug!(id = %self.id, "value-less completion for a value-carrying IO"),
        }
    }

    /// Deliver a value completion, consuming the IO.
    pub fn complete_read(self, value: Dbr) {
        match self.callback {
            IoCallback::Read(done) => done(Ok(value)),
            IoCallback::Subscription(update) => {
                let mut update = update.lock().expect("subscription callback poisoned");
                update(Ok(value));
            }
            IoCallback::Write(done) => done(Ok(())),
        }
    }

    /// Deliver a terminal exception, consuming the IO.
    pub fn fail(self, exception: CaException) {
        match self.callback {
            IoCallback::Write(done) => done(Err(exception)),
            IoCallback::Read(done) => done(Err(exception)),
            IoCallback::Subscription(update) => {
                let mut update = update.lock().expect("subscription callback poisoned");
                update(Err(exception));
            }
        }
    }
}
