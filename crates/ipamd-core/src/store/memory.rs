//! In-memory [`AllocationStore`] backed by a fixed address pool.
//!
//! Addresses are grouped by device number. Allocation picks the lowest free
//! address on the lowest device so results are deterministic. All state sits
//! behind a single [`Mutex`], which makes `assign` and `unassign` atomic per
//! identity without holding any lock across calls.

use crate::{AllocationStore, Assignment, Error, PodIdentity, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

#[derive(Debug, Default)]
struct Pool {
    /// device number -> address -> holder
    devices: BTreeMap<u32, BTreeMap<Ipv4Addr, Option<PodIdentity>>>,
    assigned: HashMap<PodIdentity, Assignment>,
}

impl Pool {
    fn device_of(&self, address: Ipv4Addr) -> Option<u32> {
        self.devices
            .iter()
            .find(|(_, addrs)| addrs.contains_key(&address))
            .map(|(device, _)| *device)
    }

    fn next_free(&self) -> Option<Assignment> {
        self.devices.iter().find_map(|(device, addrs)| {
            addrs
                .iter()
                .find(|(_, holder)| holder.is_none())
                .map(|(address, _)| Assignment::new(*address, *device))
        })
    }

    fn hold(&mut self, pod: &PodIdentity, assignment: Assignment) {
        if let Some(holder) = self
            .devices
            .get_mut(&assignment.device_number)
            .and_then(|addrs| addrs.get_mut(&assignment.address))
        {
            *holder = Some(pod.clone());
        }
        self.assigned.insert(pod.clone(), assignment);
    }

    fn release(&mut self, assignment: Assignment) {
        if let Some(holder) = self
            .devices
            .get_mut(&assignment.device_number)
            .and_then(|addrs| addrs.get_mut(&assignment.address))
        {
            *holder = None;
        }
    }
}

/// Thread-safe in-process address pool.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pool: Mutex<Pool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `addresses` to the pool under `device_number`.
    ///
    /// Re-adding an address to the device that already owns it is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if an address already belongs to a different
    /// device. Addresses preceding the conflicting one are kept.
    pub fn add_addresses(
        &self,
        device_number: u32,
        addresses: impl IntoIterator<Item = Ipv4Addr>,
    ) -> Result<()> {
        let mut pool = self.pool.lock();
        for address in addresses {
            match pool.device_of(address) {
                Some(device) if device == device_number => {}
                Some(device) => {
                    return Err(Error::Store {
                        context: format!("address {address} already belongs to device {device}"),
                    });
                }
                None => {
                    pool.devices
                        .entry(device_number)
                        .or_default()
                        .insert(address, None);
                }
            }
        }
        Ok(())
    }

    /// Records `address` as already held by `pod`.
    ///
    /// Used to rebuild state after a restart, when the only knowledge of a
    /// running sandbox is what the kubelet reports (usually name and namespace
    /// without a container id). Restoring the same pair twice is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressNotInPool`] if no device owns `address`.
    /// - [`Error::AddressInUse`] if another identity holds `address`.
    /// - [`Error::Store`] if `pod` already holds a different address.
    pub fn restore(&self, pod: &PodIdentity, address: Ipv4Addr) -> Result<Assignment> {
        let mut pool = self.pool.lock();
        let device_number = pool
            .device_of(address)
            .ok_or(Error::AddressNotInPool(address))?;
        let assignment = Assignment::new(address, device_number);

        if let Some(existing) = pool.assigned.get(pod) {
            if *existing == assignment {
                return Ok(assignment);
            }
            return Err(Error::Store {
                context: format!("{pod} already holds {}", existing.address),
            });
        }

        let held = pool
            .devices
            .get(&device_number)
            .and_then(|addrs| addrs.get(&address))
            .is_some_and(Option::is_some);
        if held {
            return Err(Error::AddressInUse(address));
        }

        pool.hold(pod, assignment);
        tracing::debug!(%pod, %address, device_number, "Restored assignment");
        Ok(assignment)
    }

    /// Total number of addresses in the pool.
    pub fn capacity(&self) -> usize {
        self.pool.lock().devices.values().map(BTreeMap::len).sum()
    }

    /// Number of addresses currently assigned.
    pub fn assigned(&self) -> usize {
        self.pool.lock().assigned.len()
    }
}

impl AllocationStore for MemoryStore {
    fn assign(&self, pod: &PodIdentity) -> Result<Assignment> {
        let mut pool = self.pool.lock();
        if let Some(existing) = pool.assigned.get(pod) {
            tracing::debug!(%pod, address = %existing.address, "Pod already has an address");
            return Ok(*existing);
        }

        let assignment = pool.next_free().ok_or(Error::PoolExhausted)?;
        pool.hold(pod, assignment);
        Ok(assignment)
    }

    fn unassign(&self, pod: &PodIdentity) -> Result<Assignment> {
        let mut pool = self.pool.lock();
        let assignment = pool.assigned.remove(pod).ok_or(Error::UnknownPod)?;
        pool.release(assignment);
        Ok(assignment)
    }
}
