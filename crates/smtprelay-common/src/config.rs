//! Configuration documents for smtprelay
//!
//! The service settings and tenant set are produced by an external
//! administrative layer as JSON documents (`config.json` plus one file
//! per tenant under `tenants.d/`). Unknown fields are ignored for
//! forward compatibility; everything required per delivery method is
//! checked at load time, not at use time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::RelayError;

/// Process-wide service settings, reloadable as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Listening port; falls back to 465 (implicit TLS) or 25
    pub listen_port: Option<u16>,

    /// Hostname used in the SMTP banner and EHLO response
    pub host_name: Option<String>,

    /// Bind/egress address on multi-homed hosts
    #[serde(rename = "serverIP")]
    pub server_ip: Option<String>,

    /// Require TLS before accepting message data
    #[serde(rename = "requireTLS", default)]
    pub require_tls: bool,

    /// Certificate/key pair; absent means STARTTLS is disabled entirely
    pub tls: Option<TlsConfig>,

    /// Optional global connection-admission CIDR list
    #[serde(rename = "allowlistIPs", default)]
    pub allowlist_ips: Vec<String>,

    /// Resolution method order; defaults to the full list in order
    #[serde(default = "default_routing_priority")]
    pub routing_priority: Vec<RoutingMethod>,

    /// Optional SMTP AUTH users; authentication is advisory, never blocking
    #[serde(default, alias = "users")]
    pub auth_users: Vec<AuthUser>,

    /// Named outbound relay definitions referenced by tenants
    #[serde(default)]
    pub smtp_servers: Vec<RelayServer>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_port: None,
            host_name: None,
            server_ip: None,
            require_tls: false,
            tls: None,
            allowlist_ips: Vec::new(),
            routing_priority: default_routing_priority(),
            auth_users: Vec::new(),
            smtp_servers: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Port the listener binds to.
    pub fn effective_port(&self) -> u16 {
        match self.listen_port {
            Some(p) => p,
            None if self.require_tls && self.tls_mode() == TlsMode::Implicit => 465,
            None => 25,
        }
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls.as_ref().map(|t| t.mode).unwrap_or(TlsMode::Starttls)
    }

    pub fn hostname(&self) -> &str {
        self.host_name.as_deref().unwrap_or("smtp-relay")
    }

    /// Look up a named relay definition.
    pub fn relay_server(&self, name: &str) -> Option<&RelayServer> {
        self.smtp_servers.iter().find(|s| s.name == name)
    }
}

/// TLS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    #[serde(default)]
    pub mode: TlsMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plaintext start with an in-band upgrade command
    #[default]
    Starttls,
    /// TLS from the first byte of the connection
    Implicit,
}

/// Tenant resolution criteria, tried in configured order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingMethod {
    #[serde(rename = "allowedSenders")]
    AllowedSenders,
    #[serde(rename = "senderDomains")]
    SenderDomains,
    #[serde(rename = "ipRanges")]
    IpRanges,
}

pub fn default_routing_priority() -> Vec<RoutingMethod> {
    vec![
        RoutingMethod::AllowedSenders,
        RoutingMethod::SenderDomains,
        RoutingMethod::IpRanges,
    ]
}

/// SMTP AUTH user entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub username: String,
    pub password: String,
}

/// Named outbound relay definition
///
/// Field names on the wire are inherited from the administrative layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayServer {
    #[serde(rename = "naam")]
    pub name: String,

    #[serde(rename = "adres")]
    pub host: String,

    #[serde(rename = "poort")]
    pub port: u16,

    /// Credentials; when present the envelope sender is rewritten to
    /// the authenticated identity on delivery
    #[serde(default)]
    pub auth: Option<RelayAuth>,

    /// Insist on STARTTLS for non-implicit ports
    #[serde(rename = "requireTLS", default)]
    pub require_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAuth {
    pub user: String,
    pub pass: String,
}

/// A logical customer/mailbox owner with its own routing rules, policy,
/// and delivery credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub name: String,

    /// Recipient whitelist during resolution, envelope-from gate after.
    /// The dual use is intentional and load-bearing; do not "fix" it.
    #[serde(default)]
    pub allowed_senders: Vec<String>,

    #[serde(default)]
    pub routing: Routing,

    #[serde(default)]
    pub policy: Policy,

    pub delivery: Delivery,
}

impl Tenant {
    /// A tenant must be resolvable by at least one routing criterion.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.allowed_senders.is_empty() && self.routing.sender_domains.is_empty() {
            return Err(RelayError::Config(format!(
                "tenant {} has neither allowedSenders nor routing.senderDomains",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default)]
    pub ip_ranges: Vec<String>,

    #[serde(default)]
    pub sender_domains: Vec<String>,

    /// Lower value wins; ties keep definition order
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            ip_ranges: Vec::new(),
            sender_domains: Vec::new(),
            priority: default_priority(),
        }
    }
}

fn default_priority() -> i32 {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(rename = "maxMessageSizeKB")]
    pub max_message_size_kb: Option<u64>,

    #[serde(default)]
    pub save_to_sent_items: bool,

    /// Overrides the observed envelope-from when set
    pub force_from: Option<String>,

    /// Archive address appended to every delivery's bcc list
    pub bcc_archive: Option<String>,

    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
}

/// Delivery backend, validated at load into the variant the method names
#[derive(Debug, Clone)]
pub enum Delivery {
    Graph(GraphDelivery),
    Smtp(SmtpDelivery),
}

impl Delivery {
    pub fn method(&self) -> &'static str {
        match self {
            Delivery::Graph(_) => "graph",
            Delivery::Smtp(_) => "smtp",
        }
    }
}

/// Wire shape of the delivery section: a method discriminator plus
/// sibling objects, only one of which must be populated.
#[derive(Debug, Clone, Deserialize)]
struct DeliverySection {
    #[serde(default = "default_method")]
    method: String,
    graph: Option<GraphDelivery>,
    smtp: Option<SmtpDelivery>,
}

fn default_method() -> String {
    "graph".to_string()
}

impl TryFrom<DeliverySection> for Delivery {
    type Error = String;

    fn try_from(section: DeliverySection) -> Result<Self, Self::Error> {
        match section.method.as_str() {
            "graph" => section
                .graph
                .map(Delivery::Graph)
                .ok_or_else(|| "delivery.method is \"graph\" but delivery.graph is missing".into()),
            "smtp" => section
                .smtp
                .map(Delivery::Smtp)
                .ok_or_else(|| "delivery.method is \"smtp\" but delivery.smtp is missing".into()),
            other => Err(format!("unknown delivery method: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for Delivery {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let section = DeliverySection::deserialize(deserializer)?;
        Delivery::try_from(section).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Delivery {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("method", self.method())?;
        match self {
            Delivery::Graph(g) => map.serialize_entry("graph", g)?,
            Delivery::Smtp(s) => map.serialize_entry("smtp", s)?,
        }
        map.end()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDelivery {
    /// Directory (tenant) identifier for the token endpoint
    pub tenant_id: String,

    /// Application identifier
    pub client_id: String,

    pub auth: GraphAuth,

    /// Mailbox the sendMail call is issued against
    pub default_mailbox: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAuth {
    /// PEM file holding the application certificate's private key
    pub cert_path: PathBuf,

    /// Hex SHA-1 thumbprint of the registered certificate
    pub thumbprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpDelivery {
    /// Name of a relay definition in `ServiceConfig::smtp_servers`
    pub smtp_server: String,
}

/// Read and parse the service settings document.
pub fn load_service_config(path: &Path) -> Result<ServiceConfig, RelayError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "service config not found, using defaults");
        return Ok(ServiceConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| RelayError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Read every `*.json` under the tenant directory, in filename order.
///
/// A single malformed or invalid tenant fails the whole load; the caller
/// keeps whatever configuration was active before.
pub fn load_tenant_dir(dir: &Path) -> Result<Vec<Tenant>, RelayError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| RelayError::Config(format!("failed to read {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("json"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut tenants = Vec::with_capacity(files.len());
    for path in files {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| RelayError::Config(format!("failed to read {}: {e}", path.display())))?;
        let tenant: Tenant = serde_json::from_str(&content)
            .map_err(|e| RelayError::Config(format!("invalid tenant {}: {e}", path.display())))?;
        tenant.validate()?;
        tenants.push(tenant);
    }
    Ok(tenants)
}
