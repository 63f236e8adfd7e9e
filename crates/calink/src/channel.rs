//! Network channels and the user-facing channel handle.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::circuit::Circuit;
use crate::context::Context;
use crate::dbr::{Dbr, DbrType};
use crate::error::Result;
use crate::io::{Ioid, ReadCallback, SubParams, SubscriptionCallback, WriteCallback};
use crate::notify::{AccessRights, SharedChannelNotify};
use crate::service::ServiceChannel;

/// Client-assigned channel identifier, unique across a context and
/// never reused while the channel exists.
pub(crate) type Cid = u32;

/// Highest accepted channel priority.
pub const PRIORITY_MAX: u8 = 99;

/// Which transport a channel currently rides.
#[derive(Clone)]
pub(crate) enum Binding {
    /// Searching over datagrams; SID, type, count and rights undefined.
    Udp,
    /// Bound to one virtual circuit.
    Tcp(Arc<Circuit>),
}

/// Context-owned state of one network channel.
pub(crate) struct Chan {
    pub cid: Cid,
    pub name: Arc<str>,
    pub priority: u8,
    pub notify: SharedChannelNotify,
    pub binding: Binding,
    /// Server-assigned id; valid only while connected.
    pub sid: u32,
    pub data_type: u16,
    pub native_count: u32,
    pub connected: bool,
    pub rights: AccessRights,
    /// Outstanding IO on this channel; agrees with the context IO table.
    pub ios: BTreeSet<Ioid>,
}

impl Chan {
    pub fn new(cid: Cid, name: Arc<str>, notify: SharedChannelNotify, priority: u8) -> Self {
        Self {
            cid,
            name,
            priority,
            notify,
            binding: Binding::Udp,
            sid: 0,
            data_type: 0,
            native_count: 0,
            connected: false,
            rights: AccessRights::default(),
            ios: BTreeSet::new(),
        }
    }

    pub fn circuit(&self) -> Option<&Arc<Circuit>> {
        match &self.binding {
            Binding::Tcp(circuit) => Some(circuit),
            Binding::Udp => None,
        }
    }

    /// Commit a connection: server identity plus native type and count.
    /// Peers too old to report access rights get read+write synthesized.
    pub fn connect(&mut self, data_type: u16, native_count: u32, sid: u32, v41: bool) {
        self.data_type = data_type;
        self.native_count = native_count;
        self.sid = sid;
        self.connected = true;
        if !v41 {
            self.rights = AccessRights::read_write();
        }
    }

    /// Drop the server binding and return to the searching state.
    pub fn disconnect(&mut self) {
        self.binding = Binding::Udp;
        self.connected = false;
        self.sid = 0;
        self.rights = AccessRights::default();
    }
}

pub(crate) enum Backing {
    Network(Cid),
    Service(Arc<dyn ServiceChannel>),
}

/// Handle to a channel.
///
/// Dropping the handle does not destroy the channel; call
/// [`Channel::destroy`] when done with it. Leaving channels alive until
/// [`Context::destroy`](crate::Context::destroy) is permitted.
pub struct Channel {
    pub(crate) ctx: Context,
    pub(crate) name: Arc<str>,
    pub(crate) backing: Backing,
}

impl Channel {
    /// The PV name this channel refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the channel is currently bound to a server.
    pub fn connected(&self) -> bool {
        match &self.backing {
            Backing::Network(cid) => self.ctx.chan_connected(*cid),
            Backing::Service(_) => true,
        }
    }

    /// Current access rights. Undefined (no access) while searching.
    pub fn access_rights(&self) -> AccessRights {
        match &self.backing {
            Backing::Network(cid) => self.ctx.chan_access_rights(*cid),
            Backing::Service(_) => AccessRights::read_write(),
        }
    }

    /// Native data type reported by the server; `None` while searching.
    pub fn native_data_type(&self) -> Option<DbrType> {
        match &self.backing {
            Backing::Network(cid) => self
                .ctx
                .chan_native(*cid)
                .and_then(|(ty, _)| DbrType::from_raw(ty)),
            Backing::Service(_) => None,
        }
    }

    /// Native element count reported by the server; `None` while
    /// searching.
    pub fn native_count(&self) -> Option<u32> {
        match &self.backing {
            Backing::Network(cid) => self.ctx.chan_native(*cid).map(|(_, count)| count),
            Backing::Service(_) => None,
        }
    }

    /// Host currently serving this channel.
    pub fn host_name(&self) -> String {
        match &self.backing {
            Backing::Network(cid) => self.ctx.chan_host_name(*cid),
            Backing::Service(_) => "<local>".into(),
        }
    }

    /// Fire-and-forget write.
    pub async fn write(&self, value: &Dbr) -> Result<()> {
        match &self.backing {
            Backing::Network(cid) => self.ctx.write_request(*cid, value).await,
            Backing::Service(svc) => svc.write(value),
        }
    }

    /// Write with a completion callback.
    pub async fn write_notify(
        &self,
        value: &Dbr,
        done: impl FnOnce(std::result::Result<(), crate::error::CaException>) + Send + 'static,
    ) -> Result<Ioid> {
        let done: WriteCallback = Box::new(done);
        match &self.backing {
            Backing::Network(cid) => self.ctx.write_notify_request(*cid, value, done).await,
            Backing::Service(svc) => {
                svc.write_notify(value, done)?;
                Ok(Ioid(0))
            }
        }
    }

    /// Read with a completion callback.
    pub async fn read_notify(
        &self,
        data_type: DbrType,
        count: u32,
        done: impl FnOnce(std::result::Result<Dbr, crate::error::CaException>) + Send + 'static,
    ) -> Result<Ioid> {
        let done: ReadCallback = Box::new(done);
        match &self.backing {
            Backing::Network(cid) => {
                self.ctx
                    .read_notify_request(*cid, data_type as u16, count, done)
                    .await
            }
            Backing::Service(svc) => {
                svc.read_notify(done)?;
                Ok(Ioid(0))
            }
        }
    }

    /// Install a durable subscription.
    ///
    /// Subscriptions survive disconnects and are re-issued on reconnect.
    pub async fn subscribe(
        &self,
        data_type: DbrType,
        count: u32,
        mask: u32,
        update: impl FnMut(std::result::Result<Dbr, crate::error::CaException>) + Send + 'static,
    ) -> Result<Ioid> {
        let update: SubscriptionCallback = Box::new(update);
        match &self.backing {
            Backing::Network(cid) => {
                let params = SubParams {
                    data_type: data_type as u16,
                    count,
                    mask,
                };
                self.ctx.subscription_request(*cid, params, update).await
            }
            Backing::Service(svc) => svc.subscribe(mask, update),
        }
    }

    /// Cancel an outstanding IO.
    ///
    /// Idempotent; returns only after any in-flight callback for the IO
    /// has completed, and no further callback for it will run.
    pub async fn cancel_io(&self, id: Ioid) -> Result<()> {
        match &self.backing {
            Backing::Network(_) => self.ctx.io_cancel(id).await,
            Backing::Service(svc) => svc.cancel_io(id),
        }
    }

    /// Destroy the channel, delivering a terminal exception to every
    /// outstanding IO.
    pub async fn destroy(self) {
        if let Backing::Network(cid) = &self.backing {
            self.ctx.destroy_channel(*cid).await;
        }
    }
}
