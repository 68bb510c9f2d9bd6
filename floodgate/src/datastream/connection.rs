use std::fmt::Display;
use std::str::FromStr;

pub const TOPIC_PLACEHOLDER: &str = "%s";

const PLAINTEXT_SCHEME: &str = "kafka://";
const SSL_SCHEME: &str = "kafkassl://";
const BROKER_LIST_DELIMITER: &str = ",";

/// A source or destination connection string of the form
/// `kafka://host[:port][,host[:port]...]/name` (`kafkassl://` for TLS).
///
/// `name` is the topic for single-topic streams, a topic regex for mirror
/// sources, or a destination pattern containing [`TOPIC_PLACEHOLDER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    brokers: Vec<BrokerAddress>,
    name: String,
    secure: bool,
}

impl ConnectionString {
    pub fn brokers(&self) -> &[BrokerAddress] {
        &self.brokers
    }

    /// Broker list in the form the client bootstrap config expects.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers
            .iter()
            .map(BrokerAddress::to_string)
            .collect::<Vec<_>>()
            .join(BROKER_LIST_DELIMITER)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Substitute a concrete topic into the name's `%s` placeholder,
    /// returning the full connection string for one destination topic.
    pub fn for_topic(&self, topic: &str) -> String {
        self.to_string().replace(TOPIC_PLACEHOLDER, topic)
    }
}

impl Display for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.secure {
            SSL_SCHEME
        } else {
            PLAINTEXT_SCHEME
        };
        write!(f, "{}{}/{}", scheme, self.bootstrap_servers(), self.name)
    }
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secure, rest) = if let Some(rest) = s.strip_prefix(SSL_SCHEME) {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix(PLAINTEXT_SCHEME) {
            (false, rest)
        } else {
            return Err(ConnectionStringError::UnknownScheme {
                value: s.to_owned(),
            });
        };

        let (broker_list, name) =
            rest.split_once('/')
                .ok_or_else(|| ConnectionStringError::MissingName {
                    value: s.to_owned(),
                })?;

        if name.is_empty() {
            return Err(ConnectionStringError::MissingName {
                value: s.to_owned(),
            });
        }

        let brokers = broker_list
            .split(BROKER_LIST_DELIMITER)
            .map(BrokerAddress::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            brokers,
            name: name.to_owned(),
            secure,
        })
    }
}

/// A single `host[:port]` entry of the broker list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    host: String,
    port: Option<u16>,
}

impl BrokerAddress {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for BrokerAddress {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split(':').collect::<Vec<_>>().as_slice() {
            [host] if !host.is_empty() => Ok(Self {
                host: (*host).to_owned(),
                port: None,
            }),
            [host, port] if !host.is_empty() => Ok(Self {
                host: (*host).to_owned(),
                port: Some(port.parse().map_err(|_| {
                    ConnectionStringError::InvalidBroker {
                        broker: s.to_owned(),
                    }
                })?),
            }),
            _ => Err(ConnectionStringError::InvalidBroker {
                broker: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionStringError {
    #[error("unknown scheme in connection string: {value}")]
    UnknownScheme { value: String },
    #[error("connection string has no topic or pattern component: {value}")]
    MissingName { value: String },
    #[error("invalid broker address: {broker}")]
    InvalidBroker { broker: String },
}
