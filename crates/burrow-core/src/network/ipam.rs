//! IP address management.
//!
//! Allocations for every subnet live in one JSON document,
//! `<network_root>/ipam.json`, mapping subnet -> address -> owning
//! container id. Each read-modify-write cycle holds an exclusive `flock`
//! on `<network_root>/ipam.lock`, so concurrent launcher processes (and
//! threads) never hand out the same address twice.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use burrow_common::error::{BurrowError, Result};

use super::subnet::Subnet;

/// subnet (CIDR) -> address -> owner.
type Allocations = BTreeMap<String, BTreeMap<String, String>>;

/// File-backed address allocator shared by all networks.
#[derive(Debug, Clone)]
pub struct Ipam {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl Ipam {
    /// Creates an allocator storing its state under `network_root`.
    #[must_use]
    pub fn new(network_root: &Path) -> Self {
        Self {
            state_path: network_root.join("ipam.json"),
            lock_path: network_root.join("ipam.lock"),
        }
    }

    /// Reserves the lowest free container address in `subnet` for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::AddressPoolExhausted`] if every address is
    /// taken, or an I/O error if the state cannot be read or written.
    pub fn allocate(&self, subnet: &Subnet, owner: &str) -> Result<Ipv4Addr> {
        self.with_state(|state| {
            let taken = state.entry(subnet.to_string()).or_default();
            let ip = subnet
                .hosts()
                .find(|ip| !taken.contains_key(&ip.to_string()))
                .ok_or_else(|| BurrowError::AddressPoolExhausted {
                    subnet: subnet.to_string(),
                })?;
            let _ = taken.insert(ip.to_string(), owner.to_owned());
            tracing::debug!(%subnet, %ip, owner, "address allocated");
            Ok((ip, true))
        })
    }

    /// Returns `ip` to the pool if it is still held by `owner`.
    ///
    /// Returns `false` when there was nothing to release: the address was
    /// already free or has since been handed to another container.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or written.
    pub fn release(&self, subnet: &Subnet, ip: Ipv4Addr, owner: &str) -> Result<bool> {
        self.with_state(|state| {
            let key = subnet.to_string();
            let Some(taken) = state.get_mut(&key) else {
                return Ok((false, false));
            };
            let addr = ip.to_string();
            if taken.get(&addr).map(String::as_str) != Some(owner) {
                tracing::debug!(%subnet, %ip, owner, "address not held by owner, nothing to release");
                return Ok((false, false));
            }
            let _ = taken.remove(&addr);
            if taken.is_empty() {
                let _ = state.remove(&key);
            }
            tracing::debug!(%subnet, %ip, owner, "address released");
            Ok((true, true))
        })
    }

    /// Number of addresses currently allocated in `subnet`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub fn allocated(&self, subnet: &Subnet) -> Result<usize> {
        self.with_state(|state| Ok((state.get(&subnet.to_string()).map_or(0, BTreeMap::len), false)))
    }

    /// Runs `f` on the allocation table under the lock. `f` returns its
    /// result and whether the table changed and must be written back.
    fn with_state<T>(&self, f: impl FnOnce(&mut Allocations) -> Result<(T, bool)>) -> Result<T> {
        let _lock = self.lock()?;
        let mut state = self.read_state()?;
        let (value, dirty) = f(&mut state)?;
        if dirty {
            self.write_state(&state)?;
        }
        Ok(value)
    }

    fn lock(&self) -> Result<nix::fcntl::Flock<File>> {
        use nix::fcntl::{Flock, FlockArg};

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BurrowError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| BurrowError::io(&self.lock_path, e))?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            BurrowError::io(&self.lock_path, std::io::Error::from(errno))
        })
    }

    fn read_state(&self) -> Result<Allocations> {
        match std::fs::read_to_string(&self.state_path) {
            Ok(data) if data.trim().is_empty() => Ok(Allocations::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Allocations::new()),
            Err(e) => Err(BurrowError::io(&self.state_path, e)),
        }
    }

    fn write_state(&self, state: &Allocations) -> Result<()> {
        let tmp = self.state_path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(state)?;
        std::fs::write(&tmp, data).map_err(|e| BurrowError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.state_path).map_err(|e| BurrowError::io(&self.state_path, e))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn subnet(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn allocates_lowest_free_address() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path());
        let net = subnet("10.9.0.0/24");
        assert_eq!(ipam.allocate(&net, "a").unwrap(), Ipv4Addr::new(10, 9, 0, 2));
        assert_eq!(ipam.allocate(&net, "b").unwrap(), Ipv4Addr::new(10, 9, 0, 3));
        assert_eq!(ipam.allocated(&net).unwrap(), 2);
    }

    #[test]
    fn released_address_is_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path());
        let net = subnet("10.9.0.0/24");
        let first = ipam.allocate(&net, "a").unwrap();
        let _ = ipam.allocate(&net, "b").unwrap();
        assert!(ipam.release(&net, first, "a").unwrap());
        assert_eq!(ipam.allocate(&net, "c").unwrap(), first);
    }

    #[test]
    fn release_happens_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path());
        let net = subnet("10.9.0.0/24");
        let ip = ipam.allocate(&net, "a").unwrap();
        assert!(ipam.release(&net, ip, "a").unwrap());
        assert!(!ipam.release(&net, ip, "a").unwrap());

        // A late release by the old owner must not free the new owner's lease.
        let again = ipam.allocate(&net, "b").unwrap();
        assert_eq!(again, ip);
        assert!(!ipam.release(&net, ip, "a").unwrap());
        assert_eq!(ipam.allocated(&net).unwrap(), 1);
    }

    #[test]
    fn exhausted_pool_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path());
        let net = subnet("10.9.0.0/30");
        let _ = ipam.allocate(&net, "a").unwrap();
        let err = ipam.allocate(&net, "b").unwrap_err();
        assert!(matches!(err, BurrowError::AddressPoolExhausted { .. }));
    }

    #[test]
    fn state_survives_new_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let net = subnet("10.9.0.0/24");
        let ip = Ipam::new(dir.path()).allocate(&net, "a").unwrap();
        let other = Ipam::new(dir.path()).allocate(&net, "b").unwrap();
        assert_ne!(ip, other);
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Arc::new(dir.path().to_path_buf());
        let net = subnet("10.9.0.0/24");

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let root = Arc::clone(&root);
                std::thread::spawn(move || Ipam::new(&root).allocate(&net, &format!("c{i}")).unwrap())
            })
            .collect();
        let ips: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ips.len(), 16);
        assert_eq!(Ipam::new(&root).allocated(&net).unwrap(), 16);
    }
}
