/*!
 * Port Registry
 * Binds ports to live instances; a port belongs to at most one instance
 */

use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::types::{InstanceId, Port};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use tracing::{debug, warn};

/// Port ownership table
#[derive(Debug)]
pub struct PortRegistry {
    range: RangeInclusive<Port>,
    skip_os_bound: bool,
    bound: Mutex<BTreeMap<Port, InstanceId>>,
}

impl PortRegistry {
    pub fn new(range: RangeInclusive<Port>, skip_os_bound: bool) -> Self {
        Self {
            range,
            skip_os_bound,
            bound: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn range(&self) -> RangeInclusive<Port> {
        self.range.clone()
    }

    /// Bind `requested`, or the lowest free port in range when `None`
    pub fn reserve(&self, id: &InstanceId, requested: Option<Port>) -> OrchestratorResult<Port> {
        let mut bound = self.bound.lock();

        if let Some(port) = requested {
            if port == 0 {
                return Err(OrchestratorError::ConfigInvalid(
                    "port 0 is not a valid service port".into(),
                ));
            }
            return match bound.get(&port) {
                Some(owner) if owner == id => Ok(port),
                Some(_) => {
                    warn!(%id, port, "Port already bound");
                    Err(OrchestratorError::PortConflict(port))
                }
                None => {
                    bound.insert(port, id.clone());
                    debug!(%id, port, "Port reserved");
                    Ok(port)
                }
            };
        }

        let port = self
            .range
            .clone()
            .filter(|p| !bound.contains_key(p))
            .find(|p| !self.skip_os_bound || os_port_free(*p))
            .ok_or_else(|| {
                OrchestratorError::exhausted(
                    "port",
                    1.0,
                    0.0,
                )
            })?;
        bound.insert(port, id.clone());
        debug!(%id, port, "Port auto-assigned");
        Ok(port)
    }

    /// Release `port` if `id` owns it
    pub fn release(&self, port: Port, id: &InstanceId) -> bool {
        let mut bound = self.bound.lock();
        match bound.get(&port) {
            Some(owner) if owner == id => {
                bound.remove(&port);
                debug!(%id, port, "Port released");
                true
            }
            _ => false,
        }
    }

    pub fn owner(&self, port: Port) -> Option<InstanceId> {
        self.bound.lock().get(&port).cloned()
    }

    pub fn bound_ports(&self) -> Vec<Port> {
        self.bound.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bound.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.lock().is_empty()
    }
}

/// Whether nothing on the host is listening on `port`
fn os_port_free(port: Port) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_assign_lowest_free() {
        let ports = PortRegistry::new(8000..=8002, false);
        assert_eq!(ports.reserve(&"a".into(), None).unwrap(), 8000);
        assert_eq!(ports.reserve(&"b".into(), None).unwrap(), 8001);
        assert!(ports.release(8000, &"a".into()));
        assert_eq!(ports.reserve(&"c".into(), None).unwrap(), 8000);
    }

    #[test]
    fn test_explicit_conflict() {
        let ports = PortRegistry::new(8000..=8999, false);
        ports.reserve(&"a".into(), Some(8080)).unwrap();
        assert_eq!(
            ports.reserve(&"b".into(), Some(8080)).unwrap_err(),
            OrchestratorError::PortConflict(8080)
        );
        assert_eq!(ports.reserve(&"a".into(), Some(8080)).unwrap(), 8080);
    }

    #[test]
    fn test_release_requires_owner() {
        let ports = PortRegistry::new(8000..=8999, false);
        ports.reserve(&"a".into(), Some(8080)).unwrap();
        assert!(!ports.release(8080, &"b".into()));
        assert_eq!(ports.owner(8080), Some("a".into()));
    }

    #[test]
    fn test_range_exhausted() {
        let ports = PortRegistry::new(8000..=8000, false);
        ports.reserve(&"a".into(), None).unwrap();
        let err = ports.reserve(&"b".into(), None).unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted { .. }));
    }
}
