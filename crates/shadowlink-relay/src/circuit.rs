//! Listener registry and circuit bookkeeping.
//!
//! A listener registers under an opaque 32-byte key and keeps the
//! registration alive by re-registering before the TTL runs out. A
//! caller opens a circuit against such a key; the pool pairs the two
//! addresses under a fresh circuit id and forwarding can begin.
//! Idle circuits and stale listeners are swept on an interval.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Why a circuit could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// No live registration under the requested key.
    UnknownTarget,
    /// Pool is at capacity.
    CircuitFull,
}

/// One registered listener.
#[derive(Debug, Clone)]
pub struct ListenerEntry {
    pub addr: SocketAddr,
    pub expires: Instant,
}

/// One established circuit between a caller and a listener.
#[derive(Debug)]
pub struct Circuit {
    pub caller: SocketAddr,
    pub listener: SocketAddr,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
}

/// Registry of listeners and active circuits.
#[derive(Debug)]
pub struct CircuitPool {
    listeners: HashMap<[u8; 32], ListenerEntry>,
    circuits: HashMap<Uuid, Circuit>,
    max_circuits: usize,
    idle_timeout: Duration,
    listener_ttl: Duration,
}

impl CircuitPool {
    pub fn new(max_circuits: usize, idle_timeout: Duration, listener_ttl: Duration) -> Self {
        Self {
            listeners: HashMap::new(),
            circuits: HashMap::new(),
            max_circuits,
            idle_timeout,
            listener_ttl,
        }
    }

    /// Register a listener, refreshing its TTL if already present.
    pub fn register(&mut self, key: [u8; 32], addr: SocketAddr) {
        let entry = ListenerEntry {
            addr,
            expires: Instant::now() + self.listener_ttl,
        };
        self.listeners.insert(key, entry);
    }

    /// Look up a live registration.
    pub fn listener(&self, key: &[u8; 32]) -> Option<&ListenerEntry> {
        self.listeners
            .get(key)
            .filter(|entry| entry.expires > Instant::now())
    }

    /// Open a circuit from `caller` to the listener registered under
    /// `key`. Returns the circuit id and the listener's address.
    pub fn open(
        &mut self,
        key: &[u8; 32],
        caller: SocketAddr,
    ) -> Result<(Uuid, SocketAddr), OpenError> {
        let listener_addr = self.listener(key).ok_or(OpenError::UnknownTarget)?.addr;

        if self.circuits.len() >= self.max_circuits {
            return Err(OpenError::CircuitFull);
        }

        let circuit = Uuid::new_v4();
        let now = Instant::now();
        self.circuits.insert(
            circuit,
            Circuit {
                caller,
                listener: listener_addr,
                created_at: now,
                last_activity: now,
                packets_forwarded: 0,
                bytes_forwarded: 0,
            },
        );

        Ok((circuit, listener_addr))
    }

    /// Route a forwarded packet: identify which endpoint `src` is and
    /// return the other end. Updates activity and rebinds the source
    /// address if it moved (NAT rebinding).
    pub fn route(&mut self, circuit: &Uuid, src: SocketAddr, bytes: usize) -> Option<SocketAddr> {
        let entry = self.circuits.get_mut(circuit)?;

        let dest = if src == entry.caller {
            entry.listener
        } else if src == entry.listener {
            entry.caller
        } else if src.ip() == entry.caller.ip() {
            // Same host, new port: the caller's NAT rebound
            entry.caller = src;
            entry.listener
        } else if src.ip() == entry.listener.ip() {
            entry.listener = src;
            entry.caller
        } else {
            return None;
        };

        entry.last_activity = Instant::now();
        entry.packets_forwarded += 1;
        entry.bytes_forwarded += bytes as u64;
        Some(dest)
    }

    /// Drop idle circuits and expired listeners.
    ///
    /// Returns (circuits removed, listeners removed).
    pub fn sweep(&mut self) -> (usize, usize) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;

        let circuits_before = self.circuits.len();
        self.circuits
            .retain(|_, c| now.duration_since(c.last_activity) <= idle_timeout);

        let listeners_before = self.listeners.len();
        self.listeners.retain(|_, l| l.expires > now);

        (
            circuits_before - self.circuits.len(),
            listeners_before - self.listeners.len(),
        )
    }

    /// Number of active circuits.
    pub fn active_count(&self) -> usize {
        self.circuits.len()
    }

    /// Number of live registrations.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> CircuitPool {
        CircuitPool::new(4, Duration::from_secs(30), Duration::from_secs(60))
    }

    #[test]
    fn test_register_and_open() {
        let mut pool = pool();
        let key = [7u8; 32];
        let listener: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let caller: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert_eq!(pool.open(&key, caller), Err(OpenError::UnknownTarget));

        pool.register(key, listener);
        let (circuit, addr) = pool.open(&key, caller).unwrap();
        assert_eq!(addr, listener);
        assert_eq!(pool.active_count(), 1);

        // Both endpoints route to each other
        assert_eq!(pool.route(&circuit, caller, 100), Some(listener));
        assert_eq!(pool.route(&circuit, listener, 100), Some(caller));

        // Strangers do not
        let stranger: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        assert_eq!(pool.route(&circuit, stranger, 100), None);
    }

    #[test]
    fn test_register_refreshes_ttl() {
        let mut pool = CircuitPool::new(4, Duration::from_secs(30), Duration::from_millis(50));
        let key = [1u8; 32];
        let listener: SocketAddr = "127.0.0.1:6000".parse().unwrap();

        pool.register(key, listener);
        assert!(pool.listener(&key).is_some());

        std::thread::sleep(Duration::from_millis(80));
        assert!(pool.listener(&key).is_none());

        pool.register(key, listener);
        assert!(pool.listener(&key).is_some());
    }

    #[test]
    fn test_circuit_capacity() {
        let mut pool = CircuitPool::new(2, Duration::from_secs(30), Duration::from_secs(60));
        let key = [2u8; 32];
        let listener: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        pool.register(key, listener);

        let caller: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        pool.open(&key, caller).unwrap();
        pool.open(&key, caller).unwrap();
        assert_eq!(pool.open(&key, caller), Err(OpenError::CircuitFull));
    }

    #[test]
    fn test_nat_rebinding_follows_source() {
        let mut pool = pool();
        let key = [3u8; 32];
        let listener: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let caller: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        pool.register(key, listener);
        let (circuit, _) = pool.open(&key, caller).unwrap();

        // Caller's port moves; same host keeps routing and future
        // replies go to the new port
        let rebound: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        assert_eq!(pool.route(&circuit, rebound, 10), Some(listener));
        assert_eq!(pool.route(&circuit, listener, 10), Some(rebound));
    }

    #[test]
    fn test_sweep_drops_idle() {
        let mut pool = CircuitPool::new(4, Duration::from_millis(20), Duration::from_millis(20));
        let key = [4u8; 32];
        let listener: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let caller: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        pool.register(key, listener);
        pool.open(&key, caller).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let (circuits, listeners) = pool.sweep();
        assert_eq!(circuits, 1);
        assert_eq!(listeners, 1);
        assert_eq!(pool.active_count(), 0);
    }
}
