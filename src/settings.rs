// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Settings
//!
//! Immutable description of a broker endpoint. Every component that opens a
//! connection reads one of these and turns it into an AMQP URI.

use crate::errors::AmqpError;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::env;

/// Scheme used for every connection URI built by this crate
pub const AMQP_SCHEME: &str = "amqp";

/// Everything but the RFC 3986 unreserved characters is escaped in the
/// userinfo and vhost parts of the URI.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub const ENV_RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const ENV_RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const ENV_RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const ENV_RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";

/// Username and password, always present together.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Broker endpoint descriptor.
///
/// The credential is either a full username/password pair or absent, which
/// [`ConnectionSettings::factory`] enforces. Hostnames are not validated:
/// a malformed host surfaces as a connection failure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionSettings {
    hostname: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    credentials: Option<Credentials>,
    #[serde(default)]
    vhost: Option<String>,
}

impl ConnectionSettings {
    /// Creates settings for `hostname` with the broker defaults for
    /// everything else.
    pub fn new(hostname: &str) -> ConnectionSettings {
        ConnectionSettings {
            hostname: hostname.to_owned(),
            port: None,
            credentials: None,
            vhost: None,
        }
    }

    /// Creates settings from their loose parts.
    ///
    /// # Errors
    /// Returns `InvalidSettings` when only one of `username` and `password`
    /// is given.
    pub fn factory(
        hostname: &str,
        port: Option<u16>,
        username: Option<&str>,
        password: Option<&str>,
        vhost: Option<&str>,
    ) -> Result<ConnectionSettings, AmqpError> {
        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.to_owned(),
                password: password.to_owned(),
            }),
            (None, None) => None,
            _ => {
                return Err(AmqpError::InvalidSettings(
                    "username and password must be given together".to_owned(),
                ))
            }
        };

        Ok(ConnectionSettings {
            hostname: hostname.to_owned(),
            port,
            credentials,
            vhost: vhost.map(str::to_owned),
        })
    }

    /// Loads the settings from the process environment, reading a `.env`
    /// file first when there is one.
    ///
    /// `RABBITMQ_HOST` defaults to `localhost`; the other variables are
    /// optional.
    pub fn from_env() -> Result<ConnectionSettings, AmqpError> {
        if let Err(err) = dotenvy::dotenv() {
            tracing::debug!(error = err.to_string(), "no .env file loaded");
        }

        let hostname = env::var(ENV_RABBITMQ_HOST).unwrap_or_else(|_| "localhost".to_owned());
        let port = match env::var(ENV_RABBITMQ_PORT) {
            Ok(value) => Some(value.parse::<u16>().map_err(|err| {
                AmqpError::InvalidSettings(format!("{ENV_RABBITMQ_PORT}: {err}"))
            })?),
            Err(_) => None,
        };
        let username = env::var(ENV_RABBITMQ_USER).ok();
        let password = env::var(ENV_RABBITMQ_PASSWORD).ok();
        let vhost = env::var(ENV_RABBITMQ_VHOST).ok();

        ConnectionSettings::factory(
            &hostname,
            port,
            username.as_deref(),
            password.as_deref(),
            vhost.as_deref(),
        )
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
        });
        self
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = Some(vhost.to_owned());
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port_number(&self) -> Option<u16> {
        self.port
    }

    pub fn credential(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn virtual_host(&self) -> Option<&str> {
        self.vhost.as_deref()
    }

    pub fn has_credential(&self) -> bool {
        self.credentials.is_some()
    }

    /// Builds `amqp://[user:pass@]host[:port]/vhost`, where a missing vhost
    /// yields the default `/` vhost (the URI then ends with `//`).
    ///
    /// Username, password and an explicit vhost are percent-encoded, so
    /// reserved characters such as `@`, `/` or `:` reach the broker as given.
    pub fn to_url(&self) -> String {
        let port = self.port.map(|p| format!(":{p}")).unwrap_or_default();
        let vhost = match self.vhost.as_deref() {
            Some(v) if !v.is_empty() => utf8_percent_encode(v, URI_COMPONENT).to_string(),
            _ => "/".to_owned(),
        };
        let host_port_path = format!("{}{}/{}", self.hostname, port, vhost);

        match &self.credentials {
            Some(c) => format!(
                "{AMQP_SCHEME}://{}:{}@{}",
                utf8_percent_encode(&c.username, URI_COMPONENT),
                utf8_percent_encode(&c.password, URI_COMPONENT),
                host_port_path
            ),
            None => format!("{AMQP_SCHEME}://{host_port_path}"),
        }
    }
}
