//! Transport registry
//!
//! Maps scheme names to connection factories. A process-wide registry is
//! populated once by [`init_registry`] with the built-in transports and can
//! be extended by embedding code with [`register`]. Rebinding a scheme is an
//! error, never a silent override.

use crate::address::Address;
use crate::config::ConnectOptions;
use crate::connection::Connection;
use crate::error::{Result, TetherError};
use crate::transport::{DaemonTransport, LocalTransport, PipeTransport, SshTransport};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// Connection factory for one scheme
pub trait Transport: Send + Sync {
    /// Establish a connection. Runs to completion on the calling thread.
    fn connect(&self, address: &Address, options: &ConnectOptions) -> Result<Connection>;
}

impl<F> Transport for F
where
    F: Fn(&Address, &ConnectOptions) -> Result<Connection> + Send + Sync,
{
    fn connect(&self, address: &Address, options: &ConnectOptions) -> Result<Connection> {
        self(address, options)
    }
}

/// Scheme → transport table
#[derive(Default)]
pub struct Registry {
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in transports
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (scheme, transport) in builtin_transports() {
            // Fresh registry, no duplicates possible
            let _ = registry.register_arc(scheme, transport);
        }
        registry
    }

    /// Bind `scheme` to `transport`
    pub fn register(&self, scheme: &str, transport: impl Transport + 'static) -> Result<()> {
        self.register_arc(scheme, Arc::new(transport))
    }

    fn register_arc(&self, scheme: &str, transport: Arc<dyn Transport>) -> Result<()> {
        let mut transports = self
            .transports
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if transports.contains_key(scheme) {
            return Err(TetherError::DuplicateScheme(scheme.to_string()));
        }
        tracing::debug!("Registered transport for scheme '{}'", scheme);
        transports.insert(scheme.to_string(), transport);
        Ok(())
    }

    /// Look up the transport for a scheme
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(scheme)
            .cloned()
    }

    /// Whether `scheme` is bound
    pub fn contains(&self, scheme: &str) -> bool {
        self.get(scheme).is_some()
    }

    /// Bound schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .transports
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        schemes.sort();
        schemes
    }

    /// Connect through the transport bound to the address scheme.
    ///
    /// The lock is released before the transport runs, so slow connection
    /// attempts never hold up registration or other dispatches.
    pub fn dispatch(&self, address: &Address, options: &ConnectOptions) -> Result<Connection> {
        let transport = self
            .get(address.scheme())
            .ok_or_else(|| TetherError::UnknownScheme(address.scheme().to_string()))?;
        tracing::debug!("Dispatching {} to '{}' transport", address, address.scheme());
        transport.connect(address, options)
    }
}

fn builtin_transports() -> Vec<(&'static str, Arc<dyn Transport>)> {
    vec![
        ("local", Arc::new(LocalTransport::new()) as Arc<dyn Transport>),
        ("ssh", Arc::new(SshTransport::new())),
        ("smb", Arc::new(PipeTransport::new())),
        ("daemon", Arc::new(DaemonTransport::new())),
    ]
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Initialize the process-wide registry with the built-in transports.
///
/// Call once at startup; later calls return the existing registry.
pub fn init_registry() -> &'static Registry {
    GLOBAL.get_or_init(Registry::with_builtins)
}

/// Bind a scheme in the process-wide registry
pub fn register(scheme: &str, transport: impl Transport + 'static) -> Result<()> {
    init_registry().register(scheme, transport)
}

/// Dispatch through the process-wide registry
pub fn dispatch(address: &Address, options: &ConnectOptions) -> Result<Connection> {
    init_registry().dispatch(address, options)
}

/// Parse `address` and connect through the process-wide registry
pub fn connect(address: &str, options: &ConnectOptions) -> Result<Connection> {
    let address = Address::parse(address)?;
    dispatch(&address, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EndOfStream;
    use std::io::sink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn null_connection(address: &Address, _options: &ConnectOptions) -> Result<Connection> {
        Ok(Connection::without_stderr(
            address.clone(),
            Box::new(sink()),
            Box::new(EndOfStream),
        ))
    }

    #[test]
    fn test_builtin_schemes() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.schemes(), vec!["daemon", "local", "smb", "ssh"]);
    }

    #[test]
    fn test_duplicate_scheme_rejected() {
        let registry = Registry::with_builtins();
        let result = registry.register("ssh", null_connection);
        assert!(matches!(result, Err(TetherError::DuplicateScheme(s)) if s == "ssh"));
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = Registry::new();
        let addr = Address::parse("carrier-pigeon:roof").unwrap();
        let result = registry.dispatch(&addr, &ConnectOptions::default());
        assert!(matches!(result, Err(TetherError::UnknownScheme(s)) if s == "carrier-pigeon"));
    }

    #[test]
    fn test_scheme_match_is_case_sensitive() {
        let registry = Registry::new();
        registry.register("test", null_connection).unwrap();
        let upper = Address::parse("TEST:x").unwrap();
        assert!(matches!(
            registry.dispatch(&upper, &ConnectOptions::default()),
            Err(TetherError::UnknownScheme(_))
        ));
    }

    #[test]
    fn test_dispatch_reaches_factory() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = Registry::new();
        registry
            .register("test", move |addr: &Address, opts: &ConnectOptions| {
                counter.fetch_add(1, Ordering::SeqCst);
                null_connection(addr, opts)
            })
            .unwrap();

        let addr = Address::parse("test:somewhere").unwrap();
        let conn = registry.dispatch(&addr, &ConnectOptions::default()).unwrap();
        assert_eq!(conn.address().target(), "somewhere");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_builtin_dispatch_never_unknown() {
        // Every built-in must be reachable; the attempts themselves may fail
        // for lack of servers, but never with UnknownScheme.
        let registry = Registry::with_builtins();
        let options = ConnectOptions::default()
            .with_port(1)
            .with_command(["/nonexistent/interpreter"])
            .with_timeout(std::time::Duration::from_millis(200));
        for raw in ["local:", "daemon:127.0.0.1", "ssh:127.0.0.1", "smb:127.0.0.1"] {
            let addr = Address::parse(raw).unwrap();
            let result = registry.dispatch(&addr, &options);
            assert!(
                !matches!(result, Err(TetherError::UnknownScheme(_))),
                "{} reported unknown scheme",
                raw
            );
        }
    }

    #[test]
    fn test_concurrent_dispatch_and_register() {
        let registry = Arc::new(Registry::new());
        registry.register("base", null_connection).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let addr = Address::parse("base:x").unwrap();
                    for _ in 0..100 {
                        registry.dispatch(&addr, &ConnectOptions::default()).unwrap();
                    }
                    registry.register(&format!("extra{}", i), null_connection).unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.schemes().len(), 9);
    }

    #[test]
    fn test_global_registry_init_once() {
        let first = init_registry() as *const Registry;
        let second = init_registry() as *const Registry;
        assert_eq!(first, second);
        assert!(init_registry().contains("local"));
    }
}
