//! C7: process-wide connection-name -> interface instance mapping.
//! Grounded on `morp/interface/__init__.py`'s module-level `interfaces`
//! dict and `get_interface`/`set_interface`, and on the teacher's own
//! `dashmap::DashMap` usage for a shared, read-mostly map
//! (`plane/src/drone/executor.rs`'s `backends: Arc<DashMap<...>>`).

use crate::config::ConnectionConfig;
use crate::error::ConfigError;
use crate::interface::Interface;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// A constructor for a backend's `Interface`, registered by each engine
/// crate so `morp-core` never needs to depend on them. Mirrors resolving
/// `interface_name` to a class in `morp/__init__.py::configure`.
pub type InterfaceFactory =
    fn(&ConnectionConfig) -> Result<Arc<dyn Interface>, ConfigError>;

static FACTORIES: Lazy<DashMap<&'static str, InterfaceFactory>> = Lazy::new(DashMap::new);

static INTERFACES: Lazy<DashMap<String, Arc<dyn Interface>>> = Lazy::new(DashMap::new);

/// Backend crates call this once (typically from a `ctor`-free
/// `register()` function invoked by the binary at startup) to make
/// themselves resolvable from a DSN scheme.
pub fn register_backend(scheme: &'static str, factory: InterfaceFactory) {
    FACTORIES.insert(scheme, factory);
}

fn backend_key(backend: crate::config::Backend) -> &'static str {
    match backend {
        crate::config::Backend::Postgres => "postgres",
        crate::config::Backend::Dropfile => "dropfile",
        crate::config::Backend::Sqs => "sqs",
    }
}

/// Configure an interface from a DSN and bind it to its fragment name
/// (empty string if none given). Mirrors `morp.configure`.
pub fn configure(dsn: &str) -> Result<Arc<dyn Interface>, ConfigError> {
    let config = ConnectionConfig::parse(dsn)?;

    if INTERFACES.contains_key(&config.name) {
        return Err(ConfigError::DuplicateConnection(config.name));
    }

    let key = backend_key(config.backend);
    let factory = *FACTORIES
        .get(key)
        .ok_or_else(|| ConfigError::UnknownScheme(key.to_string()))?;

    let interface = factory(&config)?;
    INTERFACES.insert(config.name.clone(), interface.clone());
    Ok(interface)
}

/// Scan `MORP_DSN`, `MORP_DSN_1`, `MORP_DSN_2`, … until a gap, configuring
/// an interface for each. Mirrors `morp.configure_environ`.
pub fn configure_environ() {
    configure_environ_with_prefix("MORP_DSN")
}

/// Testable variant of [`configure_environ`] taking an explicit env var
/// prefix, so tests don't fight over the real `MORP_DSN` name.
pub fn configure_environ_with_prefix(dsn_env_name: &str) {
    if let Ok(dsn) = std::env::var(dsn_env_name) {
        if let Err(e) = configure(&dsn) {
            tracing::warn!(error = %e, var = dsn_env_name, "failed to configure interface from environment");
        }
    }

    let mut n = 1;
    loop {
        let var = format!("{dsn_env_name}_{n}");
        match std::env::var(&var) {
            Ok(dsn) => {
                if let Err(e) = configure(&dsn) {
                    tracing::warn!(error = %e, var, "failed to configure interface from environment");
                }
                n += 1;
            }
            Err(_) => break,
        }
    }
}

/// Look up a previously configured interface by connection name (empty
/// string for the default connection).
pub fn get_interface(name: &str) -> Option<Arc<dyn Interface>> {
    INTERFACES.get(name).map(|r| r.clone())
}

/// Bind an already-constructed interface to a connection name. Exposed
/// mainly for tests that want to inject a fake/in-memory `Interface`.
pub fn set_interface(name: impl Into<String>, interface: Arc<dyn Interface>) {
    INTERFACES.insert(name.into(), interface);
}

/// Whether `MORP_DISABLED=1` is set, per spec §6/§4.7. Checked by the
/// message model's `send`, not by the registry itself.
pub fn is_disabled() -> bool {
    std::env::var("MORP_DISABLED").as_deref() == Ok("1")
}

/// `MORP_PREFIX`, prepended to every queue name (spec §6).
pub fn queue_prefix() -> String {
    std::env::var("MORP_PREFIX").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct NoopInterface {
        connected: AtomicBool,
    }

    #[async_trait]
    impl Interface for NoopInterface {
        async fn connect(&self) -> Result<(), crate::error::InterfaceError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> Result<(), crate::error::InterfaceError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn send(
            &self,
            _name: &str,
            fields: crate::value::Fields,
            _delay_seconds: u64,
        ) -> Result<crate::value::Fields, crate::error::InterfaceError> {
            Ok(fields)
        }
        async fn recv(
            &self,
            _name: &str,
            _timeout: Duration,
        ) -> Result<Option<crate::value::Fields>, crate::error::InterfaceError> {
            Ok(None)
        }
        async fn ack(
            &self,
            _name: &str,
            _fields: &crate::value::Fields,
        ) -> Result<(), crate::error::InterfaceError> {
            Ok(())
        }
        async fn release(
            &self,
            _name: &str,
            _fields: &crate::value::Fields,
            _delay_seconds: Option<u64>,
        ) -> Result<(), crate::error::InterfaceError> {
            Ok(())
        }
        async fn count(&self, _name: &str) -> Result<u64, crate::error::InterfaceError> {
            Ok(0)
        }
        async fn unsafe_clear(&self, _name: &str) -> Result<(), crate::error::InterfaceError> {
            Ok(())
        }
        async fn unsafe_delete(&self, _name: &str) -> Result<(), crate::error::InterfaceError> {
            Ok(())
        }
    }

    fn noop_factory(_config: &ConnectionConfig) -> Result<Arc<dyn Interface>, ConfigError> {
        Ok(Arc::new(NoopInterface {
            connected: AtomicBool::new(false),
        }))
    }

    #[test]
    fn configure_binds_interface_to_fragment_name() {
        register_backend("dropfile", noop_factory);
        let _ = Backend::Dropfile; // keep import used across cfg combos

        let name = format!("test-conn-{}", std::process::id());
        let dsn = format!("dropfile:///tmp/queues#{name}");
        configure(&dsn).unwrap();

        assert!(get_interface(&name).is_some());
    }

    #[test]
    fn duplicate_connection_name_is_rejected() {
        register_backend("dropfile", noop_factory);
        let name = format!("dup-conn-{}", std::process::id());
        let dsn = format!("dropfile:///tmp/queues#{name}");

        configure(&dsn).unwrap();
        let err = match configure(&dsn) {
            Err(e) => e,
            Ok(_) => panic!("expected duplicate connection to be rejected"),
        };
        assert!(matches!(err, ConfigError::DuplicateConnection(_)));
    }

    #[test]
    fn env_discovery_reads_numbered_dsns_until_a_gap() {
        register_backend("dropfile", noop_factory);
        let pid = std::process::id();
        let prefix = format!("MORP_TEST_DSN_{pid}");

        std::env::set_var(&prefix, format!("dropfile:///tmp/a#env-{pid}-0"));
        std::env::set_var(format!("{prefix}_1"), format!("dropfile:///tmp/b#env-{pid}-1"));
        std::env::set_var(format!("{prefix}_2"), format!("dropfile:///tmp/c#env-{pid}-2"));
        // intentionally no _3, so a following _4 (if present) must not be read

        configure_environ_with_prefix(&prefix);

        assert!(get_interface(&format!("env-{pid}-0")).is_some());
        assert!(get_interface(&format!("env-{pid}-1")).is_some());
        assert!(get_interface(&format!("env-{pid}-2")).is_some());

        std::env::remove_var(&prefix);
        std::env::remove_var(format!("{prefix}_1"));
        std::env::remove_var(format!("{prefix}_2"));
    }
}
