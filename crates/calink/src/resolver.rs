//! Asynchronous address-to-name engine.
//!
//! Reverse lookups go through a queue serviced by one worker task so
//! that no caller ever blocks on DNS; requests outlive their caller.

use std::net::SocketAddr;

use tokio::sync::mpsc;

struct Request {
    addr: SocketAddr,
    deliver: Box<dyn FnOnce(String) + Send>,
}

/// Handle to the resolution queue.
#[derive(Clone)]
pub(crate) struct Resolver {
    tx: mpsc::UnboundedSender<Request>,
}

impl Resolver {
    /// Create the engine and spawn its worker task.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let name = tokio::task::spawn_blocking(move || reverse_lookup(req.addr))
                    .await
                    .unwrap_or_else(|_| req.addr.to_string());
                (req.deliver)(name);
            }
        });
        Self { tx }
    }

    /// Queue a lookup; `deliver` runs on the worker task once the name
    /// (or, on failure, the dotted address) is known.
    pub fn lookup(&self, addr: SocketAddr, deliver: impl FnOnce(String) + Send + 'static) {
        let _ = self.tx.send(Request {
            addr,
            deliver: Box::new(deliver),
        });
    }
}

/// Blocking reverse lookup, falling back to the dotted form.
fn reverse_lookup(addr: SocketAddr) -> String {
    let SocketAddr::V4(v4) = addr else {
        return addr.to_string();
    };

    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(v4.ip().octets()),
        },
        sin_zero: [0; 8],
    };
    let mut host = [0u8; libc::NI_MAXHOST as usize];

    // SAFETY: sin is a fully initialized sockaddr_in and host is a
    // writable buffer of the passed length; getnameinfo NUL-terminates
    // on success.
    let rc = unsafe {
        libc::getnameinfo(
            (&raw const sin).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr().cast(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc == 0 {
        let end = host.iter().position(|&b| b == 0).unwrap_or(host.len());
        format!("{}:{}", String::from_utf8_lossy(&host[..end]), v4.port())
    } else {
        addr.to_string()
    }
}
