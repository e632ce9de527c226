//! Remote peer identity.
//!
//! A [`Node`] names one remote process: a stable name, an ephemeral id that
//! changes whenever the process restarts, an address and free-form
//! attributes. Nodes are immutable and hash by every field, so a restarted
//! peer (new ephemeral id) gets a fresh pooled connection.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    name: String,
    ephemeral_id: String,
    host: String,
    port: u16,
    attributes: BTreeMap<String, String>,
}

impl Node {
    /// Node with a random ephemeral id and no attributes
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        NodeBuilder::new(name, host, port).build()
    }

    /// Start building a node
    pub fn builder(name: impl Into<String>, host: impl Into<String>, port: u16) -> NodeBuilder {
        NodeBuilder::new(name, host, port)
    }

    /// Stable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id unique to this incarnation of the peer process
    pub fn ephemeral_id(&self) -> &str {
        &self.ephemeral_id
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Attribute lookup
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// All attributes
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}}}{{{}}}{{{}:{}}}",
            self.name, self.ephemeral_id, self.host, self.port
        )
    }
}

/// Generate a random ephemeral id (16 hex characters)
pub fn generate_ephemeral_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().r#gen();
    hex::encode(bytes)
}

/// Builder for [`Node`]
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    name: String,
    ephemeral_id: Option<String>,
    host: String,
    port: u16,
    attributes: BTreeMap<String, String>,
}

impl NodeBuilder {
    /// Start building a node
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ephemeral_id: None,
            host: host.into(),
            port,
            attributes: BTreeMap::new(),
        }
    }

    /// Use a fixed ephemeral id instead of a random one
    pub fn ephemeral_id(mut self, id: impl Into<String>) -> Self {
        self.ephemeral_id = Some(id.into());
        self
    }

    /// Add an attribute
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Finish the node
    pub fn build(self) -> Node {
        Node {
            name: self.name,
            ephemeral_id: self.ephemeral_id.unwrap_or_else(generate_ephemeral_id),
            host: self.host,
            port: self.port,
            attributes: self.attributes,
        }
    }
}
