//! Connection descriptions -- the advertised address of a listener.
//!
//! String form: `kind:host:port[:group]`, e.g. `tcpip:127.0.0.1:4242` or
//! `mcast:0.0.0.0:4243:render-wall`. Nodes exchange their description
//! lists as space-separated strings during the handshake.

use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// Transport kind of a connection description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Stream socket (TCP).
    Tcp,
    /// In-process pipe, used for the self-loopback.
    Pipe,
    /// Multicast group membership.
    Multicast,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Tcp => "tcpip",
            ConnectionKind::Pipe => "pipe",
            ConnectionKind::Multicast => "mcast",
        }
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self, ConnectionKind::Multicast)
    }
}

impl FromStr for ConnectionKind {
    type Err = ProtocolError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcpip" | "tcp" => Ok(ConnectionKind::Tcp),
            "pipe" => Ok(ConnectionKind::Pipe),
            "mcast" | "multicast" => Ok(ConnectionKind::Multicast),
            other => Err(ProtocolError::BadDescription(format!(
                "unknown transport kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One advertised endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDesc {
    pub kind: ConnectionKind,
    pub host: String,
    pub port: u16,
    /// Multicast group name; empty for point-to-point kinds.
    pub group: String,
}

impl ConnectionDesc {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ConnectionKind::Tcp,
            host: host.into(),
            port,
            group: String::new(),
        }
    }

    pub fn pipe() -> Self {
        Self {
            kind: ConnectionKind::Pipe,
            host: "local".into(),
            port: 0,
            group: String::new(),
        }
    }

    pub fn multicast(group: impl Into<String>) -> Self {
        Self {
            kind: ConnectionKind::Multicast,
            host: "0.0.0.0".into(),
            port: 0,
            group: group.into(),
        }
    }

    pub fn is_multicast(&self) -> bool {
        self.kind.is_multicast()
    }

    /// Two descriptions name the same multicast group.
    pub fn same_multicast_group(&self, other: &ConnectionDesc) -> bool {
        self.is_multicast() && other.is_multicast() && self.group == other.group
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serialize a description list as exchanged in handshake packets.
    pub fn join(descs: &[ConnectionDesc]) -> String {
        descs
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parse a space-separated description list.
    pub fn split(data: &str) -> Result<Vec<ConnectionDesc>, ProtocolError> {
        data.split_whitespace().map(str::parse).collect()
    }
}

impl fmt::Display for ConnectionDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.host, self.port)?;
        if !self.group.is_empty() {
            write!(f, ":{}", self.group)?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionDesc {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let kind: ConnectionKind = parts
            .next()
            .ok_or_else(|| ProtocolError::BadDescription(s.into()))?
            .parse()?;
        let host = parts
            .next()
            .ok_or_else(|| ProtocolError::BadDescription(s.into()))?
            .to_string();
        let port: u16 = match parts.next() {
            Some(p) => p
                .parse()
                .map_err(|_| ProtocolError::BadDescription(s.into()))?,
            None => crate::DEFAULT_PORT,
        };
        let group = parts.next().unwrap_or("").to_string();
        if parts.next().is_some() {
            return Err(ProtocolError::BadDescription(s.into()));
        }
        if kind.is_multicast() && group.is_empty() {
            return Err(ProtocolError::BadDescription(format!(
                "multicast description needs a group: {s}"
            )));
        }
        Ok(ConnectionDesc { kind, host, port, group })
    }
}
