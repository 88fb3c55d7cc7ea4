//! VIP pool
//!
//! Hands out unique virtual IPs from a configured CIDR to authenticated
//! clients and reclaims them on teardown. The pool is a FIFO: released
//! addresses go to the back of the free queue, so a recently-freed VIP is
//! not immediately reassigned.
//!
//! # Thread Safety
//!
//! All state sits behind one mutex, which makes `select`/`release`
//! linearizable across concurrent sessions.

use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

use crate::error::VipError;

/// FIFO pool of host addresses derived from a CIDR
#[derive(Debug)]
pub struct VipPool {
    /// Truncated network, kept for the auth reply's gateway field
    net: Ipv4Net,
    inner: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    free: VecDeque<Ipv4Addr>,
    in_use: HashSet<Ipv4Addr>,
}

impl VipPool {
    /// Create a pool over `cidr`, excluding the network address, the
    /// broadcast address, and `gateway`.
    ///
    /// # Errors
    ///
    /// Returns `VipError::InvalidCidr` if `cidr` does not parse and
    /// `VipError::GatewayOutOfRange` if `gateway` is not a host address of
    /// the network.
    pub fn new(cidr: &str, gateway: Ipv4Addr) -> Result<Self, VipError> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| VipError::InvalidCidr(cidr.to_string()))?;
        let net = net.trunc();

        if !net.contains(&gateway) {
            return Err(VipError::GatewayOutOfRange {
                gateway: gateway.to_string(),
                cidr: net.to_string(),
            });
        }

        let free: VecDeque<Ipv4Addr> = net.hosts().filter(|ip| *ip != gateway).collect();

        Ok(Self {
            net,
            inner: Mutex::new(PoolState {
                free,
                in_use: HashSet::new(),
            }),
        })
    }

    /// Allocate the next free VIP.
    ///
    /// # Errors
    ///
    /// Returns `VipError::NoVipAvailable` when the pool is exhausted.
    pub fn select(&self) -> Result<Ipv4Addr, VipError> {
        let mut state = self.inner.lock();
        let ip = state.free.pop_front().ok_or_else(|| VipError::NoVipAvailable {
            cidr: self.net.to_string(),
        })?;
        state.in_use.insert(ip);
        Ok(ip)
    }

    /// Return a VIP to the pool. No-op if the address is already free.
    pub fn release(&self, ip: Ipv4Addr) {
        let mut state = self.inner.lock();
        if state.in_use.remove(&ip) {
            state.free.push_back(ip);
        }
    }

    /// The pool's CIDR, sent to clients as the tunnel gateway network.
    #[must_use]
    pub fn cidr(&self) -> String {
        self.net.to_string()
    }

    /// Number of addresses currently handed out
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.inner.lock().in_use.len()
    }

    /// Number of addresses still free
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_30() -> VipPool {
        // 10.0.0.0/30 hosts are .1 and .2; .1 is the gateway
        VipPool::new("10.0.0.0/30", Ipv4Addr::new(10, 0, 0, 1)).unwrap()
    }

    #[test]
    fn test_select_skips_gateway() {
        let pool = pool_30();
        assert_eq!(pool.select().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(
            pool.select(),
            Err(VipError::NoVipAvailable { .. })
        ));
    }

    #[test]
    fn test_cidr_is_truncated_network() {
        // A host-addressed CIDR string still reports the network
        let pool = VipPool::new("100.64.240.1/24", Ipv4Addr::new(100, 64, 240, 1)).unwrap();
        assert_eq!(pool.cidr(), "100.64.240.0/24");
    }

    #[test]
    fn test_select_release_round_trip() {
        let pool = pool_30();
        let before = pool.free_count();
        let ip = pool.select().unwrap();
        pool.release(ip);
        assert_eq!(pool.free_count(), before);
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = pool_30();
        let ip = pool.select().unwrap();
        pool.release(ip);
        pool.release(ip);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let pool = pool_30();
        pool.release(Ipv4Addr::new(192, 0, 2, 7));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_fifo_reuse_order() {
        let pool = VipPool::new("10.0.0.0/29", Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        // hosts .1-.6 minus gateway .1 leaves .2-.6
        let a = pool.select().unwrap();
        let b = pool.select().unwrap();
        pool.release(a);
        // .4, .5, .6 are still ahead of the released .2
        assert_eq!(pool.select().unwrap(), Ipv4Addr::new(10, 0, 0, 4));
        pool.release(b);
        for _ in 0..2 {
            pool.select().unwrap();
        }
        // queue tail: released a then b
        assert_eq!(pool.select().unwrap(), a);
        assert_eq!(pool.select().unwrap(), b);
    }

    #[test]
    fn test_sets_stay_disjoint_and_complete() {
        let pool = VipPool::new("10.0.0.0/28", Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        let total = pool.free_count();
        assert_eq!(total, 13); // 14 hosts minus the gateway

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.select().unwrap());
        }
        assert_eq!(pool.free_count() + pool.in_use_count(), total);

        for ip in held {
            pool.release(ip);
        }
        assert_eq!(pool.free_count(), total);
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn test_gateway_outside_cidr() {
        let err = VipPool::new("10.0.0.0/30", Ipv4Addr::new(192, 168, 1, 1)).unwrap_err();
        assert!(matches!(err, VipError::GatewayOutOfRange { .. }));
    }

    #[test]
    fn test_invalid_cidr() {
        let err = VipPool::new("bogus", Ipv4Addr::new(10, 0, 0, 1)).unwrap_err();
        assert!(matches!(err, VipError::InvalidCidr(_)));
    }
}
