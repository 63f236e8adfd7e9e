//! User-facing notification traits.

use std::fmt;
use std::sync::Arc;

use crate::status::Status;

/// Read and write permission on a channel, as granted by its server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessRights {
    pub read: bool,
    pub write: bool,
}

impl AccessRights {
    /// Full access, synthesized for peers too old to report rights.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (true, true) => f.write_str("read|write"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Context-level notification sink.
///
/// Receives conditions that are not tied to one outstanding IO: local
/// exceptions on circuit loss, server exceptions that could not be
/// routed, and asynchronous diagnostics.
pub trait ContextNotify: Send + Sync {
    /// An exceptional condition with its context string.
    fn exception(&self, status: Status, context: &str);
}

/// Default sink: route everything through `tracing`.
#[derive(Debug, Default)]
pub struct LogNotify;

impl ContextNotify for LogNotify {
    fn exception(&self, status: Status, context: &str) {
        tracing::warn!(status = %status, context, "client context exception");
    }
}

/// Per-channel state notifications.
///
/// All methods fire under the callback lock; implementations must not
/// block indefinitely. The connect notification for a channel
/// happens-before any IO completion on that channel.
pub trait ChannelNotify: Send + Sync {
    /// The channel connected (or reconnected) to a server.
    fn connect(&self);

    /// The channel lost its server and resumed searching.
    fn disconnect(&self);

    /// The server granted or revoked access.
    fn access_rights(&self, rights: AccessRights);

    /// A fire-and-forget write was rejected by the server.
    fn write_exception(&self, status: Status, context: &str) {
        let _ = (status, context);
    }
}

/// No-op channel notification for callers that only use IO callbacks.
#[derive(Debug, Default)]
pub struct IgnoreChannelEvents;

impl ChannelNotify for IgnoreChannelEvents {
    fn connect(&self) {}
    fn disconnect(&self) {}
    fn access_rights(&self, _rights: AccessRights) {}
}

pub(crate) type SharedContextNotify = Arc<dyn ContextNotify>;
pub(crate) type SharedChannelNotify = Arc<dyn ChannelNotify>;
