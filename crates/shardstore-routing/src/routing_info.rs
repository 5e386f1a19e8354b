use std::fmt;

/// Resolved destination of one operation: host, port and partition.
///
/// Partition 0 means the commits live in the unpartitioned table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoutingInfo {
    host: Option<String>,
    port: u16,
    partition: u32,
}

impl RoutingInfo {
    pub fn new(host: impl Into<String>, port: u16, partition: u32) -> Self {
        Self {
            host: Some(host.into()),
            port,
            partition,
        }
    }

    /// "Do not route": no host, no port, no partition.
    pub fn none() -> Self {
        Self {
            host: None,
            port: 0,
            partition: 0,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn has_partition(&self) -> bool {
        self.partition > 0
    }

    /// Connection cache key, `host:port`.
    pub fn host_and_port(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or_default(), self.port)
    }
}

impl fmt::Display for RoutingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host_and_port(), self.partition)
    }
}
