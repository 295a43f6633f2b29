//! Address allocation for joining nodes.
//!
//! The overlay network is split into one disjoint host range per node
//! class. Infrastructure nodes take the lowest free address in their
//! range. Laptops first try an address derived from a hash of the owner,
//! so the same user tends to land on the same address, and fall back to
//! the lowest free one.
//!
//! Allocation reads the set of held addresses and picks one; it does not
//! reserve anything. Two concurrent requests can pick the same address,
//! and the store's uniqueness check on insert rejects the loser.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use lodestar_crypto::digest::sha256_prefix_u32;
use lodestar_crypto::nebula::Network;

use crate::error::LodestarError;
use crate::records::{Environment, NodeClass};
use crate::store::{bounded, CertificateStore};

/// Inclusive range of host offsets within the plan's network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRange {
    pub first: u32,
    pub last: u32,
}

impl HostRange {
    pub const fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    fn contains(&self, host: u32) -> bool {
        (self.first..=self.last).contains(&host)
    }

    fn overlaps(&self, other: &HostRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    HashPreferred,
}

#[derive(Debug, Clone)]
pub struct AddressPlan {
    network: Network,
    ec2: HostRange,
    laptop: HostRange,
}

impl Default for AddressPlan {
    fn default() -> Self {
        Self {
            network: Network::new(Ipv4Addr::new(192, 168, 100, 0), 24),
            ec2: HostRange::new(10, 99),
            laptop: HostRange::new(100, 199),
        }
    }
}

impl AddressPlan {
    pub fn new(network: Network, ec2: HostRange, laptop: HostRange) -> Self {
        Self {
            network,
            ec2,
            laptop,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    pub fn range(&self, class: NodeClass) -> HostRange {
        match class {
            NodeClass::Ec2 => self.ec2,
            NodeClass::Laptop => self.laptop,
        }
    }

    pub fn strategy(class: NodeClass) -> Strategy {
        match class {
            NodeClass::Ec2 => Strategy::Sequential,
            NodeClass::Laptop => Strategy::HashPreferred,
        }
    }

    /// Ranges must be non-empty, disjoint, and exclude the network and
    /// broadcast addresses.
    pub fn validate(&self) -> Result<(), LodestarError> {
        let host_bits = 32 - u32::from(self.network.prefix_len());
        if host_bits < 2 {
            return Err(LodestarError::Config(format!(
                "network {} has no room for node ranges",
                self.network
            )));
        }
        let broadcast = if host_bits == 32 {
            u32::MAX
        } else {
            (1u32 << host_bits) - 1
        };
        for (class, range) in [(NodeClass::Ec2, self.ec2), (NodeClass::Laptop, self.laptop)] {
            if range.is_empty() || range.first == 0 || range.last >= broadcast {
                return Err(LodestarError::Config(format!(
                    "{class} range {}-{} does not fit inside {}",
                    range.first, range.last, self.network
                )));
            }
        }
        if self.ec2.overlaps(&self.laptop) {
            return Err(LodestarError::Config(
                "ec2 and laptop ranges overlap".to_string(),
            ));
        }
        Ok(())
    }

    pub fn address(&self, host: u32) -> Ipv4Addr {
        Ipv4Addr::from((u32::from(self.network.addr()) & self.network.mask()) | host)
    }

    /// The class whose range contains `addr`, if any.
    pub fn class_of(&self, addr: Ipv4Addr) -> Option<NodeClass> {
        if !self.network.contains(addr) {
            return None;
        }
        let host = u32::from(addr) & !self.network.mask();
        [NodeClass::Ec2, NodeClass::Laptop]
            .into_iter()
            .find(|class| self.range(*class).contains(host))
    }

    /// Address an owner prefers within the laptop range.
    pub fn preferred(&self, owner: &str) -> Ipv4Addr {
        let range = self.laptop;
        self.address(range.first + sha256_prefix_u32(owner.as_bytes()) % range.len())
    }

    /// Pick a free address for `class`, given the addresses already held.
    pub fn pick(&self, owner: &str, class: NodeClass, taken: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        if Self::strategy(class) == Strategy::HashPreferred {
            let preferred = self.preferred(owner);
            if !taken.contains(&preferred) {
                return Some(preferred);
            }
        }
        let range = self.range(class);
        (range.first..=range.last)
            .map(|host| self.address(host))
            .find(|addr| !taken.contains(addr))
    }
}

pub struct AddressAllocator {
    plan: AddressPlan,
    store: Arc<dyn CertificateStore>,
    store_timeout: Duration,
}

impl AddressAllocator {
    pub fn new(plan: AddressPlan, store: Arc<dyn CertificateStore>, store_timeout: Duration) -> Self {
        Self {
            plan,
            store,
            store_timeout,
        }
    }

    pub fn plan(&self) -> &AddressPlan {
        &self.plan
    }

    pub async fn allocate(
        &self,
        owner: &str,
        class: NodeClass,
        environment: Option<Environment>,
    ) -> Result<Ipv4Addr, LodestarError> {
        let taken = bounded(self.store_timeout, self.store.active_addresses()).await?;
        match self.plan.pick(owner, class, &taken) {
            Some(addr) => {
                tracing::debug!(
                    owner,
                    class = %class,
                    environment = environment.map(|e| e.as_str()),
                    ip = %addr,
                    "Address selected"
                );
                Ok(addr)
            }
            None => {
                tracing::warn!(class = %class, held = taken.len(), "Address range exhausted");
                Err(LodestarError::Exhausted(class))
            }
        }
    }
}
