//! Configuration handed over by the RADIUS host.
//!
//! The host owns configuration file parsing; this module models the already
//! parsed section tree and extracts the typed settings this core cares
//! about.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Name of the subsection holding shared TLS configuration. It is not an
/// EAP method and is skipped when loading methods.
pub const TLS_CONFIG_SECTION: &str = "tls";

/// An error extracting typed settings from a configuration section.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A boolean item had an unrecognized value.
    #[error("item {name} has bad boolean value {value:?}")]
    BadBoolean {
        /// The item name.
        name: String,
        /// The offending value.
        value: String,
    },

    /// An integer item did not parse.
    #[error("item {name} has bad integer value {value:?}")]
    BadInteger {
        /// The item name.
        name: String,
        /// The offending value.
        value: String,
    },

    /// A required item was absent.
    #[error("required item {0} is missing")]
    Missing(&'static str),

    /// A required item was present but empty.
    #[error("item {0} must not be empty")]
    Empty(&'static str),
}

/// A parsed configuration section: a name, an optional instance name, items,
/// and child sections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigSection {
    name: String,
    instance: Option<String>,
    items: Vec<(String, String)>,
    children: Vec<ConfigSection>,
}

impl ConfigSection {
    /// A new empty section.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the section's instance (second) name.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Appends an item.
    pub fn with_item(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.push((name.into(), value.into()));
        self
    }

    /// Appends a child section.
    pub fn with_child(mut self, child: ConfigSection) -> Self {
        self.children.push(child);
        self
    }

    /// The section name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instance (second) name, when present.
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// The value of the first item with the given name.
    pub fn item(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(item, _)| item == name)
            .map(|(_, value)| value.as_str())
    }

    /// Child sections, in declaration order.
    pub fn children(&self) -> impl Iterator<Item = &ConfigSection> {
        self.children.iter()
    }

    /// The first child section with the given name.
    pub fn child(&self, name: &str) -> Option<&ConfigSection> {
        self.children.iter().find(|child| child.name == name)
    }

    fn bool_item(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.item(name) {
            None => Ok(default),
            Some("yes") | Some("true") | Some("1") => Ok(true),
            Some("no") | Some("false") | Some("0") => Ok(false),
            Some(other) => Err(ConfigError::BadBoolean {
                name: name.to_owned(),
                value: other.to_owned(),
            }),
        }
    }

    fn u32_item(&self, name: &str, default: u32) -> Result<u32, ConfigError> {
        match self.item(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::BadInteger {
                name: name.to_owned(),
                value: value.to_owned(),
            }),
        }
    }
}

/// Top-level settings of the EAP module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EapConfig {
    /// Name of the method started for peers that state no preference.
    pub default_method_name: String,

    /// Pass requests for unregistered EAP types back to the engine instead
    /// of failing them, so another module can own the conversation.
    pub ignore_unknown_types: bool,

    /// Work around the Cisco AP1230 accounting bug by padding the reply
    /// User-Name with two trailing NUL octets.
    pub accounting_username_bug: bool,

    /// How long a suspended session outlives its last round.
    pub session_lifetime: Duration,
}

impl EapConfig {
    /// Extracts the module settings from its configuration section.
    pub fn parse(cs: &ConfigSection) -> Result<Self, ConfigError> {
        // both deprecated; timer_expire still seeds the session lifetime
        for deprecated in ["timer_expire", "max_sessions"] {
            if cs.item(deprecated).is_some() {
                warn!("Configuration item '{deprecated}' is deprecated");
            }
        }

        let _ = cs.u32_item("max_sessions", 2048)?;

        Ok(Self {
            default_method_name: cs.item("default_eap_type").unwrap_or("md5").to_owned(),
            ignore_unknown_types: cs.bool_item("ignore_unknown_eap_types", false)?,
            accounting_username_bug: cs.bool_item("cisco_accounting_username_bug", false)?,
            session_lifetime: Duration::from_secs(u64::from(cs.u32_item("timer_expire", 60)?)),
        })
    }
}

/// Settings of a tunnelled (PEAP/TTLS-style) method instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Name of the shared TLS configuration to use.
    pub tls_conf_name: Option<String>,

    /// Module name resolving to the Auth-Type handling inner EAP.
    pub inner_eap_module: String,

    /// Virtual server the inner conversation is dispatched into.
    pub virtual_server: String,

    /// Run a Statement-of-Health sub-conversation once the tunnel is up.
    pub soh: bool,

    /// Virtual server receiving the SoH payload.
    pub soh_virtual_server: Option<String>,

    /// Demand a client certificate during the outer handshake.
    pub require_client_cert: bool,

    /// Proxy the inner conversation as EAP rather than as the decapsulated
    /// protocol.
    pub proxy_tunneled_request_as_eap: bool,
}

impl TunnelConfig {
    /// Extracts a tunnelled method's settings from its configuration section.
    pub fn parse(cs: &ConfigSection) -> Result<Self, ConfigError> {
        for deprecated in ["copy_request_to_tunnel", "use_tunneled_reply"] {
            if cs.item(deprecated).is_some() {
                warn!("Ignoring deprecated configuration item '{deprecated}'");
            }
        }

        let virtual_server = cs
            .item("virtual_server")
            .ok_or(ConfigError::Missing("virtual_server"))?;
        if virtual_server.is_empty() {
            return Err(ConfigError::Empty("virtual_server"));
        }

        Ok(Self {
            tls_conf_name: cs.item("tls").map(str::to_owned),
            inner_eap_module: cs.item("inner_eap_module").unwrap_or("eap").to_owned(),
            virtual_server: virtual_server.to_owned(),
            soh: cs.bool_item("soh", false)?,
            soh_virtual_server: cs.item("soh_virtual_server").map(str::to_owned),
            require_client_cert: cs.bool_item("require_client_cert", false)?,
            proxy_tunneled_request_as_eap: cs.bool_item("proxy_tunneled_request_as_eap", true)?,
        })
    }
}
