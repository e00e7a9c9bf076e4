use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// A peer's identity as it travels on the wire: a display name plus the endpoint its
///  listener is bound to.
///
/// Equality and hashing are based on the endpoint alone: two players may well pick the same
///  display name on different machines, but one address:port is one peer. The name exists
///  purely for humans.
#[derive(Clone, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Peer {
        Peer {
            name: name.into(),
            address,
            port,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}
impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{}:{}]", self.name, self.address, self.port)
    }
}
