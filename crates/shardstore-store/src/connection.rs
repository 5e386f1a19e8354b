//! Connection parameters and the factories that derive them per routing decision.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use secrecy::{ExposeSecret, SecretString};

use shardstore_core::StoreError;
use shardstore_routing::partition_map::DEFAULT_PORT;
use shardstore_routing::RoutingInfo;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%(?P<name>[A-Za-z_][A-Za-z0-9_]*)%").expect("valid env reference regex")
});

/// Parsed `key=value;` connection string.
#[derive(Clone, Debug, Default)]
pub struct ConnectionParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub application_name: Option<String>,
    /// Join the session's unit of work when one is active.
    pub enlist: bool,
    /// Keep the password when the parameters are rendered back to a string.
    pub persist_security_info: bool,
    /// Keys this crate does not interpret, preserved in order.
    pub options: Vec<(String, String)>,
}

impl ConnectionParams {
    pub fn parse(connection_string: &str) -> Result<Self, StoreError> {
        let mut params = Self::default();
        for segment in connection_string.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                StoreError::Configuration(format!(
                    "connection string segment {segment:?} is not key=value"
                ))
            })?;
            let key = key.trim();
            let value = value.trim();
            match key.to_ascii_lowercase().as_str() {
                "host" | "server" => params.host = Some(value.to_string()),
                "port" => {
                    params.port = Some(value.parse().map_err(|_| {
                        StoreError::Configuration(format!("invalid port {value:?}"))
                    })?)
                }
                "database" => params.database = Some(value.to_string()),
                "username" | "user id" | "userid" | "user" => {
                    params.username = Some(value.to_string())
                }
                "password" | "pwd" => params.password = Some(SecretString::from(value.to_string())),
                "application name" | "applicationname" => {
                    params.application_name = Some(value.to_string())
                }
                "enlist" => params.enlist = parse_bool(key, value)?,
                "persist security info" | "persistsecurityinfo" => {
                    params.persist_security_info = parse_bool(key, value)?
                }
                _ => params.options.push((key.to_string(), value.to_string())),
            }
        }
        Ok(params)
    }

    /// `host:port`, defaulting to `localhost:5432`. Keys the session's connection cache.
    pub fn host_and_port(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("localhost"),
            self.port.unwrap_or(DEFAULT_PORT)
        )
    }

    /// Owner of schemas created through these parameters.
    pub fn owner(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    /// Same parameters for a connection that never joins a unit of work.
    pub fn without_enlist(&self) -> Self {
        Self {
            enlist: false,
            ..self.clone()
        }
    }

    pub fn to_connection_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(host) = &self.host {
            parts.push(format!("Host={host}"));
        }
        if let Some(port) = self.port {
            parts.push(format!("Port={port}"));
        }
        if let Some(db) = &self.database {
            parts.push(format!("Database={db}"));
        }
        if let Some(user) = &self.username {
            parts.push(format!("Username={user}"));
        }
        if self.persist_security_info {
            if let Some(pw) = &self.password {
                parts.push(format!("Password={}", pw.expose_secret()));
            }
        }
        if let Some(app) = &self.application_name {
            parts.push(format!("Application Name={app}"));
        }
        parts.push(format!("Enlist={}", self.enlist));
        parts.push(format!("Persist Security Info={}", self.persist_security_info));
        for (k, v) in &self.options {
            parts.push(format!("{k}={v}"));
        }
        parts.join(";")
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_connection_string())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, StoreError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(StoreError::Configuration(format!(
            "{key} expects a boolean, got {value:?}"
        ))),
    }
}

/// Replace `%NAME%` with `lookup(NAME)`. Unknown names stay verbatim.
pub fn expand_vars_with<F>(input: &str, lookup: F) -> Cow<'_, str>
where
    F: Fn(&str) -> Option<String>,
{
    ENV_REFERENCE.replace_all(input, |caps: &Captures<'_>| {
        lookup(&caps["name"]).unwrap_or_else(|| caps[0].to_string())
    })
}

pub fn expand_env_vars(input: &str) -> Cow<'_, str> {
    expand_vars_with(input, |name| std::env::var(name).ok())
}

/// Derives the parameters of the connection serving a routing decision.
pub trait ConnectionFactory: Send + Sync {
    fn params_for(&self, routing: &RoutingInfo) -> ConnectionParams;
}

/// One template, host and port taken from the routing decision.
#[derive(Clone, Debug)]
pub struct RoutedConnFactory {
    template: ConnectionParams,
}

impl RoutedConnFactory {
    pub fn new(connection_string: &str) -> Result<Self, StoreError> {
        Ok(Self::from_params(ConnectionParams::parse(&expand_env_vars(
            connection_string,
        ))?))
    }

    pub fn from_params(mut template: ConnectionParams) -> Self {
        template.enlist = true;
        template.persist_security_info = true;
        Self { template }
    }

    pub fn template(&self) -> &ConnectionParams {
        &self.template
    }
}

impl ConnectionFactory for RoutedConnFactory {
    fn params_for(&self, routing: &RoutingInfo) -> ConnectionParams {
        let mut params = self.template.clone();
        if let Some(host) = routing.host() {
            params.host = Some(host.to_string());
            params.port = Some(routing.port());
        }
        params
    }
}

/// Every routing decision maps to the same host.
#[derive(Clone, Debug)]
pub struct SingularConnFactory {
    template: ConnectionParams,
}

impl SingularConnFactory {
    pub fn new(connection_string: &str) -> Result<Self, StoreError> {
        Ok(Self::from_params(ConnectionParams::parse(&expand_env_vars(
            connection_string,
        ))?))
    }

    pub fn from_params(mut template: ConnectionParams) -> Self {
        template.enlist = true;
        template.persist_security_info = true;
        Self { template }
    }

    pub fn template(&self) -> &ConnectionParams {
        &self.template
    }
}

impl ConnectionFactory for SingularConnFactory {
    fn params_for(&self, _routing: &RoutingInfo) -> ConnectionParams {
        self.template.clone()
    }
}
