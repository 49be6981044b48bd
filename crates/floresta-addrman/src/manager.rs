//! The address manager keeps every address we know about in two tables: "new", for
//! addresses someone told us about, and "tried", for addresses we managed to connect to at
//! least once. Both tables are split into buckets, and where an address goes is decided by
//! keyed hashes of its network group (see [`crate::bucket`]). This bounds how much of our
//! tables any single network can fill, making eclipse attacks much harder.
//!
//! Records live in a single arena indexed by an id, buckets only hold ids. A record in the
//! new table may be referenced by up to [`NEW_BUCKETS_PER_ADDRESS`] buckets, one for each
//! source that told us about it, while a record in the tried table lives in a single slot.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use bitcoin::p2p::ServiceFlags;
use rand::rngs::OsRng;
use rand::rngs::StdRng;
use rand::Rng;
use rand::RngCore;
use rand::SeedableRng;
use spin::Mutex;
use tracing::debug;
use tracing::info;

use crate::addr_info::canonical;
use crate::addr_info::AddrInfo;
use crate::addr_info::PeerAddress;
use crate::bucket::bucket_position;
use crate::bucket::new_bucket;
use crate::bucket::tried_bucket;
use crate::bucket::BucketTable;
use crate::bucket::SecretKey;
use crate::bucket::Table;
use crate::bucket::BUCKET_SIZE;
use crate::bucket::NEW_BUCKETS_PER_ADDRESS;
use crate::bucket::NEW_BUCKET_COUNT;
use crate::bucket::TRIED_BUCKET_COUNT;
use crate::config::AddrManConfig;
use crate::error::AddrManError;
use crate::netgroup::is_routable;
use crate::netgroup::AsMap;
use crate::netgroup::NetGroupManager;
use crate::time::Clock;
use crate::time::SystemClock;

/// An address seen less than this long ago is probably online
const ONLINE_WINDOW: u64 = 24 * 60 * 60; // 24 hours

/// How often we update the timestamp of an address that seems to be online
const ONLINE_UPDATE_INTERVAL: u64 = 60 * 60; // 1 hour

/// How often we update the timestamp of an address that doesn't seem to be online
const OFFLINE_UPDATE_INTERVAL: u64 = 24 * 60 * 60; // 24 hours

/// How often a live connection refreshes the timestamp of its address
const CONNECTED_UPDATE_INTERVAL: u64 = 20 * 60; // 20 minutes

/// Every chance-based rejection during selection makes the next candidate this much more
/// likely to be accepted
const SELECTION_FACTOR_GROWTH: f64 = 1.2;

/// The secret key used in deterministic mode
const DETERMINISTIC_KEY: SecretKey = {
    let mut key = [0; 32];
    key[0] = 1;
    key
};

/// The RNG seed used in deterministic mode
const DETERMINISTIC_SEED: u64 = 0;

/// Everything the address manager protects with its lock
pub(crate) struct AddrManInner {
    /// The secret key for all placement hashes
    pub(crate) key: SecretKey,

    pub(crate) rng: StdRng,

    /// Whether `clear` should reset the key and RNG to fixed values
    pub(crate) deterministic: bool,

    pub(crate) tried_selection_chance: f64,

    pub(crate) netgroup: NetGroupManager,

    /// The record arena
    pub(crate) map_info: HashMap<usize, AddrInfo>,

    /// Finds the record id for an address
    pub(crate) map_addr: HashMap<SocketAddr, usize>,

    /// All record ids, in an order we shuffle when sampling
    pub(crate) random: Vec<usize>,

    /// The id for the next record we create
    pub(crate) next_id: usize,

    pub(crate) new_table: BucketTable,

    pub(crate) tried_table: BucketTable,

    /// How many records are in the new table
    pub(crate) n_new: usize,

    /// How many records are in the tried table
    pub(crate) n_tried: usize,

    /// Last time we marked any address as good
    pub(crate) last_good: u64,

    /// A record that wants to move to the tried table, but whose slot is taken
    pub(crate) tried_collision: Option<usize>,
}

impl AddrManInner {
    pub(crate) fn new(
        deterministic: bool,
        tried_selection_chance: f64,
        netgroup: NetGroupManager,
    ) -> Self {
        let mut inner = AddrManInner {
            key: DETERMINISTIC_KEY,
            rng: StdRng::seed_from_u64(DETERMINISTIC_SEED),
            deterministic,
            tried_selection_chance: tried_selection_chance.clamp(0.0, 1.0),
            netgroup,
            map_info: HashMap::new(),
            map_addr: HashMap::new(),
            random: Vec::new(),
            next_id: 0,
            new_table: BucketTable::new(NEW_BUCKET_COUNT),
            tried_table: BucketTable::new(TRIED_BUCKET_COUNT),
            n_new: 0,
            n_tried: 0,
            last_good: 1,
            tried_collision: None,
        };

        inner.clear();
        inner
    }

    /// An empty manager, with the same settings as this one
    pub(crate) fn empty_like(&self) -> Self {
        AddrManInner::new(
            self.deterministic,
            self.tried_selection_chance,
            self.netgroup.clone(),
        )
    }

    pub(crate) fn clear(&mut self) {
        if self.deterministic {
            self.key = DETERMINISTIC_KEY;
            self.rng = StdRng::seed_from_u64(DETERMINISTIC_SEED);
        } else {
            OsRng.fill_bytes(&mut self.key);
            self.rng = StdRng::from_entropy();
        }

        self.map_info.clear();
        self.map_addr.clear();
        self.random.clear();
        self.next_id = 0;
        self.new_table.clear();
        self.tried_table.clear();
        self.n_new = 0;
        self.n_tried = 0;
        self.last_good = 1;
        self.tried_collision = None;
    }

    pub(crate) fn size(&self) -> usize {
        self.random.len()
    }

    pub(crate) fn find(&self, addr: &SocketAddr) -> Option<usize> {
        self.map_addr.get(&canonical(addr)).copied()
    }

    /// Creates a record that isn't referenced by any table yet
    pub(crate) fn create(&mut self, address: &PeerAddress, source: IpAddr) -> usize {
        let id = self.next_id;
        self.next_id += 1;

        let mut info = AddrInfo::new(address, source);
        info.random_pos = self.random.len();

        self.map_addr.insert(info.addr, id);
        self.map_info.insert(id, info);
        self.random.push(id);

        id
    }

    /// Removes a record from both tables and forgets about it
    pub(crate) fn delete(&mut self, id: usize) {
        let Some(info) = self.map_info.get(&id) else {
            return;
        };

        let addr = info.addr;
        let random_pos = info.random_pos;
        let in_tried = info.in_tried;
        let ref_count = info.ref_count;

        if in_tried {
            let bucket = tried_bucket(&self.key, &self.netgroup, &addr);
            let position = bucket_position(&self.key, Table::Tried, bucket, &addr);
            if self.tried_table.get(bucket, position) == Some(id) {
                self.tried_table.take(bucket, position);
            }
            self.n_tried -= 1;
        }

        if ref_count > 0 {
            self.remove_from_new(id);
            self.n_new -= 1;
        }

        if self.tried_collision == Some(id) {
            self.tried_collision = None;
        }

        let last = self.random.len() - 1;
        self.swap_random(random_pos, last);
        self.random.pop();
        self.map_addr.remove(&addr);
        self.map_info.remove(&id);
    }

    pub(crate) fn swap_random(&mut self, first: usize, second: usize) {
        if first == second {
            return;
        }

        let id_first = self.random[first];
        let id_second = self.random[second];

        if let Some(info) = self.map_info.get_mut(&id_first) {
            info.random_pos = second;
        }

        if let Some(info) = self.map_info.get_mut(&id_second) {
            info.random_pos = first;
        }

        self.random.swap(first, second);
    }

    /// Drops every new table reference to this record. A record's position inside a
    /// bucket only depends on the bucket and the address, so we can find it in any bucket
    /// without knowing which sources placed it there.
    fn remove_from_new(&mut self, id: usize) {
        let Some(info) = self.map_info.get(&id) else {
            return;
        };

        let addr = info.addr;
        let mut remaining = info.ref_count;

        for bucket in 0..NEW_BUCKET_COUNT {
            if remaining == 0 {
                break;
            }

            let position = bucket_position(&self.key, Table::New, bucket, &addr);
            if self.new_table.get(bucket, position) == Some(id) {
                self.new_table.take(bucket, position);
                remaining -= 1;
            }
        }

        if let Some(info) = self.map_info.get_mut(&id) {
            info.ref_count = 0;
        }
    }

    /// Empties a slot in the new table. If that was the last reference to the record
    /// living there, the record is deleted.
    fn clear_new(&mut self, bucket: usize, position: usize) {
        let Some(id) = self.new_table.take(bucket, position) else {
            return;
        };

        let Some(info) = self.map_info.get_mut(&id) else {
            return;
        };

        info.ref_count = info.ref_count.saturating_sub(1);
        if info.ref_count == 0 {
            self.n_new -= 1;
            self.delete(id);
        }
    }

    /// Whether a new table slot may be taken from its current occupant
    fn is_replaceable(&self, occupant: usize, incoming_refs: u8, now: u64) -> bool {
        match self.map_info.get(&occupant) {
            Some(existing) => {
                existing.is_terrible(now) || (existing.ref_count > 1 && incoming_refs == 0)
            }
            None => true,
        }
    }

    pub(crate) fn add_single(
        &mut self,
        address: &PeerAddress,
        source: IpAddr,
        time_penalty: u64,
        now: u64,
    ) -> bool {
        let addr = canonical(&address.addr);
        if !is_routable(&addr.ip()) {
            return false;
        }

        let source = source.to_canonical();

        // a node announcing itself doesn't get penalized
        let time_penalty = if addr.ip() == source { 0 } else { time_penalty };

        let id = match self.find(&addr) {
            Some(id) => {
                let Some(info) = self.map_info.get_mut(&id) else {
                    return false;
                };

                let update_interval = if now.saturating_sub(address.time) < ONLINE_WINDOW {
                    ONLINE_UPDATE_INTERVAL
                } else {
                    OFFLINE_UPDATE_INTERVAL
                };

                if info.time < address.time.saturating_sub(update_interval + time_penalty) {
                    info.time = address.time.saturating_sub(time_penalty);
                }

                info.services |= address.services;

                // nothing new, already tried or already in as many buckets as allowed
                if address.time <= info.time
                    || info.in_tried
                    || info.ref_count == NEW_BUCKETS_PER_ADDRESS
                {
                    return false;
                }

                // each extra reference is twice as hard to get as the last one
                let ref_count = info.ref_count;
                if ref_count > 0 && self.rng.gen_range(0..(1u32 << ref_count)) != 0 {
                    return false;
                }

                id
            }
            None => {
                let id = self.create(address, source);
                if let Some(info) = self.map_info.get_mut(&id) {
                    info.time = info.time.saturating_sub(time_penalty);
                }
                id
            }
        };

        let bucket = new_bucket(&self.key, &self.netgroup, &addr, &source);
        let position = bucket_position(&self.key, Table::New, bucket, &addr);

        let occupant = self.new_table.get(bucket, position);
        if occupant == Some(id) {
            return false;
        }

        let ref_count = self.map_info.get(&id).map_or(0, |info| info.ref_count);
        let insert = match occupant {
            None => true,
            Some(occupant) => self.is_replaceable(occupant, ref_count, now),
        };

        if insert {
            self.clear_new(bucket, position);
            if let Some(info) = self.map_info.get_mut(&id) {
                if info.ref_count == 0 {
                    self.n_new += 1;
                }
                info.ref_count += 1;
            }
            self.new_table.set(bucket, position, id);
        } else if ref_count == 0 {
            self.delete(id);
        }

        insert
    }

    pub(crate) fn good(&mut self, addr: &SocketAddr, time: u64, now: u64) -> bool {
        self.last_good = time;

        let Some(id) = self.find(addr) else {
            return false;
        };

        let Some(info) = self.map_info.get_mut(&id) else {
            return false;
        };

        info.last_success = time;
        info.last_try = time;
        info.attempts = 0;

        // nothing to promote
        if info.in_tried || info.ref_count == 0 {
            return false;
        }

        let addr = info.addr;
        let bucket = tried_bucket(&self.key, &self.netgroup, &addr);
        let position = bucket_position(&self.key, Table::Tried, bucket, &addr);

        if let Some(incumbent) = self.tried_table.get(bucket, position) {
            let incumbent = self.map_info.get(&incumbent).map(|info| info.addr);
            debug!(
                "Collision in the tried table: {addr} wants the slot of {incumbent:?}, \
                 waiting for it to be resolved"
            );

            self.tried_collision = Some(id);
            return false;
        }

        self.make_tried(id, now);
        true
    }

    /// Moves a record from the new table into its tried slot. If someone is already in
    /// that slot, it gets moved back into the new table.
    pub(crate) fn make_tried(&mut self, id: usize, now: u64) {
        let Some(info) = self.map_info.get(&id) else {
            return;
        };

        let addr = info.addr;
        if info.ref_count > 0 {
            self.remove_from_new(id);
            self.n_new -= 1;
        }

        let bucket = tried_bucket(&self.key, &self.netgroup, &addr);
        let position = bucket_position(&self.key, Table::Tried, bucket, &addr);

        if let Some(evicted) = self.tried_table.take(bucket, position) {
            self.n_tried -= 1;
            self.demote(evicted, now);
        }

        self.tried_table.set(bucket, position, id);
        self.n_tried += 1;

        if let Some(info) = self.map_info.get_mut(&id) {
            info.in_tried = true;
        }
    }

    /// Puts a record that just lost its tried slot back into the new table. If its new
    /// slot is held by someone we can't replace, the record is forgotten.
    fn demote(&mut self, id: usize, now: u64) -> bool {
        let Some(info) = self.map_info.get_mut(&id) else {
            return false;
        };

        info.in_tried = false;
        let addr = info.addr;
        let source = info.source;

        let bucket = new_bucket(&self.key, &self.netgroup, &addr, &source);
        let position = bucket_position(&self.key, Table::New, bucket, &addr);

        if let Some(occupant) = self.new_table.get(bucket, position) {
            let replaceable = self
                .map_info
                .get(&occupant)
                .map_or(true, |existing| {
                    existing.is_terrible(now) || existing.ref_count > 1
                });

            if !replaceable {
                debug!("No room in the new table for {addr}, forgetting it");
                self.delete(id);
                return false;
            }

            self.clear_new(bucket, position);
        }

        if let Some(info) = self.map_info.get_mut(&id) {
            info.ref_count = 1;
        }

        self.new_table.set(bucket, position, id);
        self.n_new += 1;
        true
    }

    pub(crate) fn attempt(&mut self, addr: &SocketAddr, count_failure: bool, time: u64) {
        let Some(id) = self.find(addr) else {
            return;
        };

        let Some(info) = self.map_info.get_mut(&id) else {
            return;
        };

        info.last_try = time;

        // only one failure counts between two calls to good
        if count_failure && info.last_count_attempt < self.last_good {
            info.last_count_attempt = time;
            info.attempts = info.attempts.saturating_add(1);
        }
    }

    pub(crate) fn connected(&mut self, addr: &SocketAddr, time: u64) {
        let Some(id) = self.find(addr) else {
            return;
        };

        if let Some(info) = self.map_info.get_mut(&id) {
            if time.saturating_sub(info.time) > CONNECTED_UPDATE_INTERVAL {
                info.time = time;
            }
        }
    }

    pub(crate) fn set_services(&mut self, addr: &SocketAddr, services: ServiceFlags) {
        let Some(id) = self.find(addr) else {
            return;
        };

        if let Some(info) = self.map_info.get_mut(&id) {
            info.services = services;
        }
    }

    pub(crate) fn select(&mut self, new_only: bool, now: u64) -> Option<AddrInfo> {
        if self.random.is_empty() || (new_only && self.n_new == 0) {
            return None;
        }

        let use_tried = !new_only
            && self.n_tried > 0
            && (self.n_new == 0 || self.rng.gen::<f64>() < self.tried_selection_chance);

        if !use_tried && self.n_new == 0 {
            return None;
        }

        let (table, bucket_count) = if use_tried {
            (&self.tried_table, TRIED_BUCKET_COUNT)
        } else {
            (&self.new_table, NEW_BUCKET_COUNT)
        };

        let mut chance_factor = 1.0;
        loop {
            let bucket = self.rng.gen_range(0..bucket_count);
            let start = self.rng.gen_range(0..BUCKET_SIZE);

            // look for the first entry from a random position, wrapping around
            let Some(id) = (0..BUCKET_SIZE)
                .map(|i| (start + i) % BUCKET_SIZE)
                .find_map(|position| table.get(bucket, position))
            else {
                continue;
            };

            let Some(info) = self.map_info.get(&id) else {
                continue;
            };

            if self.rng.gen::<f64>() < chance_factor * info.chance(now) {
                return Some(info.clone());
            }

            chance_factor *= SELECTION_FACTOR_GROWTH;
        }
    }

    pub(crate) fn get_addr(
        &mut self,
        max_addresses: usize,
        max_pct: usize,
        now: u64,
    ) -> Vec<PeerAddress> {
        let mut count = self.random.len();
        if max_pct != 0 {
            count = max_pct.min(100) * count / 100;
        }

        if max_addresses != 0 {
            count = count.min(max_addresses);
        }

        // a partial Fisher-Yates shuffle over the random ordering
        let mut addresses = Vec::with_capacity(count);
        for n in 0..self.random.len() {
            if addresses.len() >= count {
                break;
            }

            let pick = self.rng.gen_range(n..self.random.len());
            self.swap_random(n, pick);

            let Some(info) = self.map_info.get(&self.random[n]) else {
                continue;
            };

            if info.is_terrible(now) {
                continue;
            }

            addresses.push(info.peer_address());
        }

        addresses
    }

    pub(crate) fn select_tried_collision(&mut self) -> Option<AddrInfo> {
        let id = self.tried_collision?;
        match self.map_info.get(&id) {
            Some(info) if !info.in_tried => Some(info.clone()),
            _ => {
                self.tried_collision = None;
                None
            }
        }
    }

    /// Audits every invariant we keep between the arena, the maps and the tables
    pub(crate) fn check(&self) -> Result<(), AddrManError> {
        if self.key == [0; 32] {
            return Err(AddrManError::Inconsistent("secret key is unset"));
        }

        if self.random.len() != self.n_new + self.n_tried {
            return Err(AddrManError::Inconsistent(
                "random ordering doesn't match the table counts",
            ));
        }

        if self.map_info.len() != self.random.len() || self.map_addr.len() != self.map_info.len()
        {
            return Err(AddrManError::Inconsistent("id maps have different sizes"));
        }

        let mut tried = HashSet::new();
        let mut new_refs = HashMap::new();

        for (id, info) in self.map_info.iter() {
            if info.in_tried {
                if info.last_success == 0 {
                    return Err(AddrManError::Inconsistent("tried record never succeeded"));
                }

                if info.ref_count != 0 {
                    return Err(AddrManError::Inconsistent(
                        "tried record is referenced by the new table",
                    ));
                }

                tried.insert(*id);
            } else {
                if info.ref_count == 0 || info.ref_count > NEW_BUCKETS_PER_ADDRESS {
                    return Err(AddrManError::Inconsistent(
                        "new record has an invalid reference count",
                    ));
                }

                new_refs.insert(*id, info.ref_count);
            }

            if self.map_addr.get(&info.addr) != Some(id) {
                return Err(AddrManError::Inconsistent(
                    "address map doesn't point back to its record",
                ));
            }

            if self.random.get(info.random_pos) != Some(id) {
                return Err(AddrManError::Inconsistent(
                    "random ordering doesn't point back to its record",
                ));
            }
        }

        if tried.len() != self.n_tried || new_refs.len() != self.n_new {
            return Err(AddrManError::Inconsistent("table counters are off"));
        }

        for (bucket, position, id) in self.tried_table.occupied() {
            let Some(info) = self.map_info.get(&id) else {
                return Err(AddrManError::Inconsistent(
                    "tried table references an unknown record",
                ));
            };

            if tried_bucket(&self.key, &self.netgroup, &info.addr) != bucket
                || bucket_position(&self.key, Table::Tried, bucket, &info.addr) != position
            {
                return Err(AddrManError::Inconsistent("tried record in the wrong slot"));
            }

            if !tried.remove(&id) {
                return Err(AddrManError::Inconsistent(
                    "record appears twice in the tried table",
                ));
            }
        }

        if !tried.is_empty() {
            return Err(AddrManError::Inconsistent(
                "tried record missing from the tried table",
            ));
        }

        for (bucket, position, id) in self.new_table.occupied() {
            let Some(info) = self.map_info.get(&id) else {
                return Err(AddrManError::Inconsistent(
                    "new table references an unknown record",
                ));
            };

            if bucket_position(&self.key, Table::New, bucket, &info.addr) != position {
                return Err(AddrManError::Inconsistent("new record in the wrong slot"));
            }

            match new_refs.get_mut(&id) {
                Some(refs) if *refs > 0 => *refs -= 1,
                _ => {
                    return Err(AddrManError::Inconsistent(
                        "new record has more references than it counts",
                    ))
                }
            }
        }

        if new_refs.values().any(|refs| *refs != 0) {
            return Err(AddrManError::Inconsistent(
                "new record has fewer references than it counts",
            ));
        }

        Ok(())
    }

    /// Where in the tables this address is, as (table, bucket, position)
    #[cfg(test)]
    pub(crate) fn placements(&self, addr: &SocketAddr) -> Vec<(Table, usize, usize)> {
        let Some(id) = self.find(addr) else {
            return Vec::new();
        };

        let tried = self
            .tried_table
            .occupied()
            .filter(|(_, _, entry)| *entry == id)
            .map(|(bucket, position, _)| (Table::Tried, bucket, position));

        let new = self
            .new_table
            .occupied()
            .filter(|(_, _, entry)| *entry == id)
            .map(|(bucket, position, _)| (Table::New, bucket, position));

        tried.chain(new).collect()
    }
}

/// A bucketed address manager.
///
/// All operations take `&self` and lock an internal mutex for their whole duration, so a
/// single manager can be shared between tasks behind an [`Arc`]. None of them block, the
/// only operation that waits on the network is
/// [`resolve_collisions`](AddrMan::resolve_collisions), and it doesn't hold the lock while
/// doing so.
pub struct AddrMan {
    pub(crate) inner: Mutex<AddrManInner>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl AddrMan {
    /// Creates an address manager that reads time from the system clock
    pub fn new(config: &AddrManConfig, asmap: Option<AsMap>) -> Self {
        Self::with_clock(config, asmap, Arc::new(SystemClock))
    }

    /// Creates an address manager with a custom time source, usually a network adjusted
    /// clock
    pub fn with_clock(
        config: &AddrManConfig,
        asmap: Option<AsMap>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = AddrManInner::new(
            config.deterministic,
            config.tried_selection_chance,
            NetGroupManager::new(asmap),
        );

        AddrMan {
            inner: Mutex::new(inner),
            clock,
        }
    }

    /// Creates an address manager, loading the ASN map referenced by the config, if any
    pub fn from_config(config: &AddrManConfig) -> Result<Self, AddrManError> {
        let asmap = match config.asmap.as_deref() {
            Some(path) => {
                let asmap = AsMap::from_file(path)?;
                info!(
                    "Loaded ASN map from {} with {} entries",
                    path.display(),
                    asmap.len()
                );
                Some(asmap)
            }
            None => None,
        };

        Ok(Self::new(config, asmap))
    }

    /// How many addresses we know about
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    /// How many addresses are in the new table
    pub fn new_count(&self) -> usize {
        self.inner.lock().n_new
    }

    /// How many addresses are in the tried table
    pub fn tried_count(&self) -> usize {
        self.inner.lock().n_tried
    }

    /// The checksum of the ASN map in use, all zeros if we group by IP prefix
    pub fn asmap_checksum(&self) -> [u8; 32] {
        self.inner.lock().netgroup.asmap_checksum()
    }

    /// Adds addresses that `source` told us about. Returns whether any of them got a new
    /// table slot.
    pub fn add(&self, addresses: &[PeerAddress], source: IpAddr) -> bool {
        self.add_with_penalty(addresses, source, 0)
    }

    /// Like [`add`](AddrMan::add), but addresses are considered `time_penalty` seconds
    /// older than announced, unless `source` is announcing itself
    pub fn add_with_penalty(
        &self,
        addresses: &[PeerAddress],
        source: IpAddr,
        time_penalty: u64,
    ) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let added = addresses
            .iter()
            .filter(|address| inner.add_single(address, source, time_penalty, now))
            .count();

        if added > 0 {
            debug!(
                "Added {added} of {} addresses from {source}: {} tried, {} new",
                addresses.len(),
                inner.n_tried,
                inner.n_new
            );
        }

        added > 0
    }

    /// Marks an address as good, we just connected to it. If it's in the new table, it's
    /// moved to the tried table, unless its tried slot is taken. In that case we remember
    /// the collision, see [`resolve_collisions`](AddrMan::resolve_collisions).
    ///
    /// Returns whether the address moved to the tried table.
    pub fn good(&self, addr: &SocketAddr) -> bool {
        self.good_at(addr, self.clock.now())
    }

    pub fn good_at(&self, addr: &SocketAddr, time: u64) -> bool {
        let now = self.clock.now();
        self.inner.lock().good(addr, time, now)
    }

    /// Records a connection attempt. If `count_failure` is set, this counts towards the
    /// failures of this address, but only once between two calls to [`good`](AddrMan::good).
    pub fn attempt(&self, addr: &SocketAddr, count_failure: bool) {
        self.attempt_at(addr, count_failure, self.clock.now());
    }

    pub fn attempt_at(&self, addr: &SocketAddr, count_failure: bool, time: u64) {
        self.inner.lock().attempt(addr, count_failure, time);
    }

    /// We are connected to this address right now. This refreshes its timestamp, but not
    /// more than once every 20 minutes.
    pub fn connected(&self, addr: &SocketAddr) {
        self.connected_at(addr, self.clock.now());
    }

    pub fn connected_at(&self, addr: &SocketAddr, time: u64) {
        self.inner.lock().connected(addr, time);
    }

    /// Overwrites the services of an address, usually after its version message
    pub fn set_services(&self, addr: &SocketAddr, services: ServiceFlags) {
        self.inner.lock().set_services(addr, services);
    }

    /// Picks an address to connect to. Returns `None` if there's nothing to pick from.
    ///
    /// If `new_only` is set, only the new table is considered. Otherwise we pick from the
    /// tried table with the configured probability. Inside a table, addresses that failed
    /// recently are less likely to be picked.
    pub fn select(&self, new_only: bool) -> Option<AddrInfo> {
        let now = self.clock.now();
        self.inner.lock().select(new_only, now)
    }

    /// Returns a random sample of the addresses we know, for sharing with peers.
    ///
    /// At most `max_pct` percent of all addresses and at most `max_addresses` are returned,
    /// zero meaning no limit. Terrible addresses are never returned.
    pub fn get_addr(&self, max_addresses: usize, max_pct: usize) -> Vec<PeerAddress> {
        let now = self.clock.now();
        self.inner.lock().get_addr(max_addresses, max_pct, now)
    }

    /// Returns the address waiting for a tried slot, if any
    pub fn select_tried_collision(&self) -> Option<AddrInfo> {
        self.inner.lock().select_tried_collision()
    }

    /// Everything we know about this address
    pub fn find(&self, addr: &SocketAddr) -> Option<AddrInfo> {
        let inner = self.inner.lock();
        let id = inner.find(addr)?;
        inner.map_info.get(&id).cloned()
    }

    /// Forgets about all addresses and rolls a new secret key
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Checks the internal consistency of the address manager
    pub fn check(&self) -> Result<(), AddrManError> {
        self.inner.lock().check()
    }
}
