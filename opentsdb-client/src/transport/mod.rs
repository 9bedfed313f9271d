use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs as _},
    time::Duration,
};

#[cfg(unix)]
use std::path::PathBuf;

pub mod http;
mod io;

pub(crate) use self::io::{connect, spawn, IoThread, Outbound, TransportEvents, TransportHandle, WriteReceipt};

/// Address of the server to send data points to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteAddr {
    /// A TCP server.
    Tcp(Vec<SocketAddr>),

    /// A UDP server.
    Udp(Vec<SocketAddr>),

    /// A server listening on a Unix domain stream socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl RemoteAddr {
    /// Returns the transport ID for the remote address.
    ///
    /// This is a simple acronym related to the transport that will be used for the remote address, such as `udp` for
    /// UDP, and so on.
    pub const fn transport_id(&self) -> &'static str {
        match self {
            RemoteAddr::Tcp(_) => "tcp",
            RemoteAddr::Udp(_) => "udp",
            #[cfg(unix)]
            RemoteAddr::Unix(_) => "uds-stream",
        }
    }

    /// Returns `true` if the transport sends discrete datagrams rather than a byte stream.
    pub const fn is_datagram(&self) -> bool {
        matches!(self, RemoteAddr::Udp(_))
    }

    /// Returns the value to send in the HTTP `Host` header.
    pub fn host_header(&self) -> String {
        match self {
            RemoteAddr::Tcp(addrs) | RemoteAddr::Udp(addrs) => {
                addrs.first().map_or_else(|| "localhost".to_string(), ToString::to_string)
            }
            #[cfg(unix)]
            RemoteAddr::Unix(_) => "localhost".to_string(),
        }
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddr::Tcp(addrs) | RemoteAddr::Udp(addrs) => match addrs.first() {
                Some(addr) => write!(f, "{}://{addr}", self.transport_id()),
                None => write!(f, "{}://<none>", self.transport_id()),
            },
            #[cfg(unix)]
            RemoteAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        let Some((scheme, rest)) = addr.split_once("://") else {
            return resolve(addr).map(RemoteAddr::Tcp);
        };

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => resolve(rest).map(RemoteAddr::Tcp),
            "udp" => resolve(rest).map(RemoteAddr::Udp),
            #[cfg(unix)]
            "unix" => Ok(RemoteAddr::Unix(PathBuf::from(rest))),
            _ => Err(format!("invalid scheme '{scheme}' (expected 'tcp', 'udp', or 'unix')")),
        }
    }
}

fn resolve(addr: &str) -> Result<Vec<SocketAddr>, String> {
    let addrs = addr.to_socket_addrs().map_err(|e| e.to_string())?.collect::<Vec<_>>();
    if addrs.is_empty() {
        return Err(format!("'{addr}' did not resolve to any address"));
    }
    Ok(addrs)
}

/// Transport configuration.
#[derive(Clone, Debug)]
pub struct TransportConfiguration {
    pub remote_addr: RemoteAddr,
    pub connect_timeout: Duration,

    // Compress everything written to a stream connection as one gzip stream per connection.
    pub compress_stream: bool,
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::RemoteAddr;

    #[test]
    fn parse_remote_addresses() {
        let local = SocketAddr::from(([127, 0, 0, 1], 4242));
        let cases = [
            ("127.0.0.1:4242", Ok(RemoteAddr::Tcp(vec![local]))),
            ("tcp://127.0.0.1:4242", Ok(RemoteAddr::Tcp(vec![local]))),
            ("UDP://127.0.0.1:4242", Ok(RemoteAddr::Udp(vec![local]))),
            ("ftp://127.0.0.1:21", Err("invalid scheme 'ftp' (expected 'tcp', 'udp', or 'unix')".to_string())),
        ];

        for (input, expected) in cases {
            assert_eq!(RemoteAddr::try_from(input), expected, "input: {input}");
        }

        assert!(RemoteAddr::try_from("no-port-here").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn parse_unix_address() {
        let addr = RemoteAddr::try_from("unix:///var/run/tsdb.sock").unwrap();
        assert_eq!(addr, RemoteAddr::Unix("/var/run/tsdb.sock".into()));
        assert_eq!(addr.transport_id(), "uds-stream");
        assert!(!addr.is_datagram());
        assert_eq!(addr.host_header(), "localhost");
    }

    #[test]
    fn transport_properties() {
        let udp = RemoteAddr::try_from("udp://127.0.0.1:4242").unwrap();
        assert_eq!(udp.transport_id(), "udp");
        assert!(udp.is_datagram());
        assert_eq!(udp.host_header(), "127.0.0.1:4242");
        assert_eq!(udp.to_string(), "udp://127.0.0.1:4242");
    }
}
