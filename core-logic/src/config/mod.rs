use serde::{Deserialize, Serialize};

/// HTTP proxy in front of an RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One route to the chain: the RPC URL, optionally tunnelled through a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}
