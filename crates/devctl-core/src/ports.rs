use std::io;
use thiserror::Error;
use tracing::debug;

pub const MAX_PORT: u16 = u16::MAX;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no available port between {start} and 65535")]
    NoAvailablePort { start: u16 },
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl PortError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PortError::NoAvailablePort { .. })
    }
}

pub fn is_addr_in_use(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AddrInUse
}

/// Binds the first port from `start` upward that `bind` accepts.
///
/// Only "address in use" counts as a collision; any other bind failure is returned as-is.
pub fn allocate<L, F>(start: u16, mut bind: F) -> Result<L, PortError>
where
    F: FnMut(u16) -> io::Result<L>,
{
    if start == 0 {
        return Err(PortError::NoAvailablePort { start });
    }
    let mut port = start;
    loop {
        match bind(port) {
            Ok(listener) => return Ok(listener),
            Err(err) if is_addr_in_use(&err) => {
                debug!(event = "port_collision", port, error = %err);
                if port == MAX_PORT {
                    return Err(PortError::NoAvailablePort { start });
                }
                port += 1;
            }
            Err(source) => return Err(PortError::Bind { port, source }),
        }
    }
}
