use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use shardstore_core::StoreError;

use crate::partition_map::DEFAULT_PORT;

static HOST_AND_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<host>[\w.\-]+)(:(?P<port>\d+))?$").expect("valid host:port regex")
});

/// A database host address as written on the command line, `host[:port]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, StoreError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(StoreError::InvalidArgument("host is empty".into()));
        }
        if port < 1024 {
            return Err(StoreError::InvalidArgument(format!(
                "port {port} is not in range <1024, 65535>"
            )));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for HostAndPort {
    type Err = StoreError;

    /// Parse `host[:port]`; the port defaults to 5432.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = HOST_AND_PORT
            .captures(s.trim())
            .ok_or_else(|| StoreError::InvalidArgument(format!("invalid host name: {s}")))?;
        let port = match caps.name("port") {
            Some(p) => p
                .as_str()
                .parse::<u16>()
                .map_err(|_| StoreError::InvalidArgument(format!("invalid port in {s}")))?,
            None => DEFAULT_PORT,
        };
        Self::new(&caps["host"], port)
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
