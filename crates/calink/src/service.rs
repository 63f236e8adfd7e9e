//! Local PV services.
//!
//! Channel creation consults locally registered services first, then the
//! process-wide registry, and only builds a network channel when neither
//! claims the name. Services bypass the network entirely.

use std::sync::{Arc, OnceLock, RwLock};

use crate::dbr::Dbr;
use crate::error::Result;
use crate::io::{Ioid, ReadCallback, SubscriptionCallback, WriteCallback};
use crate::notify::{ChannelNotify, SharedChannelNotify};

/// A provider of locally hosted PVs.
pub trait PvService: Send + Sync {
    /// Claim a name, or decline it with `None`.
    fn create_channel(
        &self,
        name: &str,
        notify: Arc<dyn ChannelNotify>,
        priority: u8,
    ) -> Option<Arc<dyn ServiceChannel>>;
}

/// A channel hosted by a [`PvService`].
///
/// Service channels are permanently connected; operations complete
/// without network traffic but deliver through the same callback shapes
/// as network channels.
pub trait ServiceChannel: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, value: &Dbr) -> Result<()>;

    fn write_notify(&self, value: &Dbr, done: WriteCallback) -> Result<()>;

    fn read_notify(&self, done: ReadCallback) -> Result<()>;

    fn subscribe(&self, mask: u32, update: SubscriptionCallback) -> Result<Ioid>;

    fn cancel_io(&self, id: Ioid) -> Result<()>;
}

/// An ordered list of services, first claim wins.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    services: RwLock<Vec<Arc<dyn PvService>>>,
}

impl ServiceRegistry {
    pub fn register(&self, service: Arc<dyn PvService>) {
        self.services
            .write()
            .expect("service registry poisoned")
            .push(service);
    }

    pub fn create_channel(
        &self,
        name: &str,
        notify: &SharedChannelNotify,
        priority: u8,
    ) -> Option<Arc<dyn ServiceChannel>> {
        let services = self.services.read().expect("service registry poisoned");
        services
            .iter()
            .find_map(|s| s.create_channel(name, notify.clone(), priority))
    }
}

static GLOBAL: OnceLock<ServiceRegistry> = OnceLock::new();

pub(crate) fn global() -> &'static ServiceRegistry {
    GLOBAL.get_or_init(ServiceRegistry::default)
}

/// Register a service with every context in this process.
pub fn register_global(service: Arc<dyn PvService>) {
    global().register(service);
}
