//! Loading and lookup of the configured EAP methods.

use std::sync::Arc;

use eap_radius_protocol::Method;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ConfigError, ConfigSection, EapConfig, TLS_CONFIG_SECTION};
use crate::method::{EapMethod, MethodHandle};

/// An error loading a single method submodule.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LoadError {
    /// No submodule of that name is available.
    #[error("no such EAP submodule: {0}")]
    NotFound(String),

    /// The submodule needs a TLS library that is not available. This is the
    /// one non-fatal load error: the method is skipped with a warning, so a
    /// stock configuration can ship with the TLS methods enabled.
    #[error("TLS library support is not available")]
    TlsUnavailable,

    /// The submodule's configuration was unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The submodule refused to instantiate.
    #[error("failed to instantiate: {0}")]
    Instantiate(String),
}

/// An error that aborts module bootstrap.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The module's own configuration was unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A configured subsection does not name an EAP type.
    #[error("unknown EAP type {0}")]
    UnknownType(String),

    /// A configured subsection names a meta-type or an out-of-range number.
    #[error("invalid EAP method {0} (unsupported)")]
    InvalidMethod(String),

    /// A submodule failed to load.
    #[error("failed to load EAP method {name}: {source}")]
    Load {
        /// The method's configuration name.
        name: String,
        /// Why it failed.
        source: LoadError,
    },

    /// Every configured method was skipped or absent.
    #[error("no EAP method configured, module cannot do anything")]
    NoMethods,

    /// `default_eap_type` does not name an EAP type.
    #[error("unknown default EAP type {0}")]
    UnknownDefault(String),

    /// `default_eap_type` names a type with no loaded method.
    #[error("no such sub-type for default EAP method {0}")]
    DefaultNotRegistered(String),
}

/// The host's submodule loader: resolves a method's configuration section to
/// an instantiated [`EapMethod`].
pub trait MethodLoader {
    /// Loads and instantiates the submodule for `method` from its
    /// configuration section.
    fn load(&self, method: Method, cs: &ConfigSection) -> Result<Arc<dyn EapMethod>, LoadError>;
}

/// The configured methods, indexed densely by EAP type number. Immutable
/// after bootstrap, so lookups need no locking.
#[derive(Debug)]
pub struct MethodRegistry {
    methods: Vec<Option<Arc<MethodHandle>>>,
    default_method: Method,
}

impl MethodRegistry {
    /// Loads every method subsection of the module configuration.
    ///
    /// Subsections named [`TLS_CONFIG_SECTION`] are shared TLS configuration
    /// and skipped. A method whose loader reports
    /// [`LoadError::TlsUnavailable`] is skipped with a warning; any other
    /// load failure is fatal, as is an unknown or out-of-range type name, an
    /// empty result, or a `default_eap_type` that did not end up registered.
    pub fn bootstrap(
        cs: &ConfigSection,
        config: &EapConfig,
        loader: &dyn MethodLoader,
    ) -> Result<Self, BootstrapError> {
        let mut methods: Vec<Option<Arc<MethodHandle>>> = Vec::new();
        methods.resize_with(usize::from(Method::MAX), || None);
        let mut num_methods = 0;

        for scs in cs.children() {
            let name = scs.name();

            if name == TLS_CONFIG_SECTION {
                continue;
            }

            let method = Method::from_name(name)
                .ok_or_else(|| BootstrapError::UnknownType(name.to_owned()))?;
            if !method.is_authentication() {
                return Err(BootstrapError::InvalidMethod(name.to_owned()));
            }

            let submodule = match loader.load(method, scs) {
                Ok(submodule) => submodule,
                Err(LoadError::TlsUnavailable) => {
                    warn!("Ignoring EAP method {name} because we don't have TLS support");
                    continue;
                }
                Err(source) => {
                    return Err(BootstrapError::Load {
                        name: name.to_owned(),
                        source,
                    });
                }
            };

            debug!("Loaded EAP method {method}");
            methods[usize::from(method.num())] =
                Some(Arc::new(MethodHandle::new(method, submodule, scs.clone())));
            num_methods += 1;
        }

        if num_methods == 0 {
            return Err(BootstrapError::NoMethods);
        }

        let default_method = Method::from_name(&config.default_method_name)
            .ok_or_else(|| BootstrapError::UnknownDefault(config.default_method_name.clone()))?;
        if methods[usize::from(default_method.num())].is_none() {
            return Err(BootstrapError::DefaultNotRegistered(
                config.default_method_name.clone(),
            ));
        }

        Ok(Self {
            methods,
            default_method,
        })
    }

    /// The handle registered for a method, if any.
    pub fn get(&self, method: Method) -> Option<&Arc<MethodHandle>> {
        self.methods.get(usize::from(method.num()))?.as_ref()
    }

    /// Whether a method is registered.
    pub fn contains(&self, method: Method) -> bool {
        self.get(method).is_some()
    }

    /// The configured default method.
    pub fn default_method(&self) -> Method {
        self.default_method
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodError;
    use crate::radius::Request;
    use crate::session::EapSession;

    struct NullMethod;

    impl EapMethod for NullMethod {
        fn name(&self) -> &'static str {
            "eap_null"
        }

        fn session_init(
            &self,
            _request: &mut Request,
            _session: &mut EapSession,
        ) -> Result<(), MethodError> {
            Ok(())
        }

        fn process(
            &self,
            _request: &mut Request,
            _session: &mut EapSession,
        ) -> Result<(), MethodError> {
            Ok(())
        }
    }

    struct FakeLoader {
        tls_available: bool,
    }

    impl MethodLoader for FakeLoader {
        fn load(
            &self,
            method: Method,
            _cs: &ConfigSection,
        ) -> Result<Arc<dyn EapMethod>, LoadError> {
            if !self.tls_available && matches!(method, Method::TLS | Method::TTLS | Method::PEAP) {
                return Err(LoadError::TlsUnavailable);
            }

            Ok(Arc::new(NullMethod))
        }
    }

    fn loader() -> FakeLoader {
        FakeLoader {
            tls_available: true,
        }
    }

    fn config_for(cs: &ConfigSection) -> EapConfig {
        EapConfig::parse(cs).expect("section should parse")
    }

    #[test]
    fn bootstrap_registers_configured_methods() {
        let cs = ConfigSection::new("eap")
            .with_child(ConfigSection::new("md5"))
            .with_child(ConfigSection::new("tls"))
            .with_child(ConfigSection::new("peap"));

        let registry = MethodRegistry::bootstrap(&cs, &config_for(&cs), &loader())
            .expect("bootstrap should succeed");

        assert!(registry.contains(Method::MD5));
        assert!(registry.contains(Method::PEAP));
        // the "tls" subsection is shared configuration, not a method
        assert!(!registry.contains(Method::TLS));
        assert_eq!(registry.default_method(), Method::MD5);
    }

    #[test]
    fn bootstrap_rejects_unknown_type_name() {
        let cs = ConfigSection::new("eap").with_child(ConfigSection::new("kerberos"));

        let error = MethodRegistry::bootstrap(&cs, &config_for(&cs), &loader())
            .expect_err("unknown type should be fatal");
        assert!(matches!(error, BootstrapError::UnknownType(name) if name == "kerberos"));
    }

    #[test]
    fn bootstrap_rejects_meta_type_section() {
        let cs = ConfigSection::new("eap").with_child(ConfigSection::new("identity"));

        let error = MethodRegistry::bootstrap(&cs, &config_for(&cs), &loader())
            .expect_err("meta types cannot be configured as methods");
        assert!(matches!(error, BootstrapError::InvalidMethod(name) if name == "identity"));
    }

    #[test]
    fn bootstrap_skips_tls_methods_without_tls_support() {
        let cs = ConfigSection::new("eap")
            .with_child(ConfigSection::new("md5"))
            .with_child(ConfigSection::new("peap"));
        let loader = FakeLoader {
            tls_available: false,
        };

        let registry = MethodRegistry::bootstrap(&cs, &config_for(&cs), &loader)
            .expect("md5 alone should be enough");

        assert!(registry.contains(Method::MD5));
        assert!(!registry.contains(Method::PEAP));
    }

    #[test]
    fn bootstrap_requires_at_least_one_method() {
        let cs = ConfigSection::new("eap").with_child(ConfigSection::new("tls"));

        let error = MethodRegistry::bootstrap(&cs, &config_for(&cs), &loader())
            .expect_err("no methods should be fatal");
        assert!(matches!(error, BootstrapError::NoMethods));
    }

    #[test]
    fn bootstrap_requires_registered_default() {
        let cs = ConfigSection::new("eap")
            .with_item("default_eap_type", "peap")
            .with_child(ConfigSection::new("md5"));

        let error = MethodRegistry::bootstrap(&cs, &config_for(&cs), &loader())
            .expect_err("unregistered default should be fatal");
        assert!(matches!(error, BootstrapError::DefaultNotRegistered(name) if name == "peap"));
    }
}
