//! Bucket tables and the keyed hashes deciding where each address goes.
//!
//! Every placement hash is a double-sha256 over our secret key, a tag naming the call site
//! and a list of length-prefixed inputs. Without the key, nobody can predict which bucket
//! an address lands in, so nobody can engineer addresses to push ours out.

use std::net::IpAddr;
use std::net::SocketAddr;

use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::hashes::HashEngine;

use crate::addr_info::address_key;
use crate::addr_info::ip_to_bytes;
use crate::netgroup::NetGroupManager;

/// How many buckets the new table has
pub const NEW_BUCKET_COUNT: usize = 1024;

/// How many buckets the tried table has
pub const TRIED_BUCKET_COUNT: usize = 256;

/// How many slots each bucket has
pub const BUCKET_SIZE: usize = 64;

/// A single record is never referenced by more than this many new buckets
pub const NEW_BUCKETS_PER_ADDRESS: u8 = 8;

/// Over how many tried buckets a single group spreads
pub const TRIED_BUCKETS_PER_GROUP: u64 = 8;

/// Over how many new buckets addresses from a single source group spread. This is split
/// as 8 offsets picked by the address group, times 8 offsets picked by the source itself.
pub const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;

const GROUP_OFFSETS: u64 = 8;
const SOURCE_OFFSETS: u64 = NEW_BUCKETS_PER_SOURCE_GROUP / GROUP_OFFSETS;

/// The secret key all placement hashes are keyed with
pub type SecretKey = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Which of the two tables we're talking about
pub enum Table {
    New,
    Tried,
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
/// Domain separation for the placement hashes, each call site gets its own tag
enum HashTag {
    NewBase = 0,
    NewGroup = 1,
    NewSource = 2,
    TriedBase = 3,
    TriedAddress = 4,
    NewPosition = 5,
    TriedPosition = 6,
}

fn keyed_hash(key: &SecretKey, tag: HashTag, parts: &[&[u8]]) -> u64 {
    let mut engine = sha256d::Hash::engine();
    engine.input(key);
    engine.input(&[tag as u8]);

    for part in parts {
        engine.input(&(part.len() as u32).to_le_bytes());
        engine.input(part);
    }

    let hash = sha256d::Hash::from_engine(engine);
    let [a, b, c, d, e, f, g, h, ..] = hash.to_byte_array();
    u64::from_le_bytes([a, b, c, d, e, f, g, h])
}

/// The new bucket for an address, as announced by `source`.
///
/// The source group picks a base bucket, the address group picks one of 8 offsets from
/// there, and the source address itself picks one of 8 more. So a single source group can
/// only ever reach [`NEW_BUCKETS_PER_SOURCE_GROUP`] buckets, no matter how many addresses
/// it sends us.
pub fn new_bucket(
    key: &SecretKey,
    netgroup: &NetGroupManager,
    addr: &SocketAddr,
    source: &IpAddr,
) -> usize {
    let source_group = netgroup.group(source);
    let address_group = netgroup.group(&addr.ip());

    let base = keyed_hash(key, HashTag::NewBase, &[&source_group]) % NEW_BUCKET_COUNT as u64;
    let group_offset =
        keyed_hash(key, HashTag::NewGroup, &[&source_group, &address_group]) % GROUP_OFFSETS;
    let source_offset =
        keyed_hash(key, HashTag::NewSource, &[&ip_to_bytes(source)]) % SOURCE_OFFSETS;

    let bucket = base + group_offset * SOURCE_OFFSETS + source_offset;
    (bucket % NEW_BUCKET_COUNT as u64) as usize
}

/// The tried bucket for an address. Only the address matters here, the source doesn't.
pub fn tried_bucket(key: &SecretKey, netgroup: &NetGroupManager, addr: &SocketAddr) -> usize {
    let address_group = netgroup.group(&addr.ip());

    let base = keyed_hash(key, HashTag::TriedBase, &[&address_group]) % TRIED_BUCKET_COUNT as u64;
    let offset = keyed_hash(key, HashTag::TriedAddress, &[&address_key(addr)])
        % TRIED_BUCKETS_PER_GROUP;

    ((base + offset) % TRIED_BUCKET_COUNT as u64) as usize
}

/// The slot inside `bucket` where this address goes
pub fn bucket_position(key: &SecretKey, table: Table, bucket: usize, addr: &SocketAddr) -> usize {
    let tag = match table {
        Table::New => HashTag::NewPosition,
        Table::Tried => HashTag::TriedPosition,
    };

    let bucket = (bucket as u32).to_le_bytes();
    (keyed_hash(key, tag, &[&bucket, &address_key(addr)]) % BUCKET_SIZE as u64) as usize
}

#[derive(Debug, Clone)]
/// A grid of buckets, each slot holding the id of a record, if any
pub(crate) struct BucketTable {
    buckets: Vec<[Option<usize>; BUCKET_SIZE]>,
}

impl BucketTable {
    pub(crate) fn new(bucket_count: usize) -> Self {
        BucketTable {
            buckets: vec![[None; BUCKET_SIZE]; bucket_count],
        }
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn get(&self, bucket: usize, position: usize) -> Option<usize> {
        self.buckets[bucket][position]
    }

    pub(crate) fn set(&mut self, bucket: usize, position: usize, id: usize) {
        self.buckets[bucket][position] = Some(id);
    }

    /// Empties a slot, returning whoever was there
    pub(crate) fn take(&mut self, bucket: usize, position: usize) -> Option<usize> {
        self.buckets[bucket][position].take()
    }

    /// All the ids in a bucket, in slot order
    pub(crate) fn entries(&self, bucket: usize) -> impl Iterator<Item = usize> + '_ {
        self.buckets[bucket].iter().filter_map(|slot| *slot)
    }

    /// Every occupied slot, as (bucket, position, id)
    pub(crate) fn occupied(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.buckets.iter().enumerate().flat_map(|(bucket, slots)| {
            slots
                .iter()
                .enumerate()
                .filter_map(move |(position, slot)| slot.map(|id| (bucket, position, id)))
        })
    }

    pub(crate) fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket = [None; BUCKET_SIZE];
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::net::IpAddr;
    use std::net::SocketAddr;

    use super::bucket_position;
    use super::new_bucket;
    use super::tried_bucket;
    use super::BucketTable;
    use super::SecretKey;
    use super::Table;
    use super::BUCKET_SIZE;
    use super::NEW_BUCKET_COUNT;
    use super::TRIED_BUCKET_COUNT;
    use crate::netgroup::test::test_asmap;
    use crate::netgroup::NetGroupManager;

    const KEY: SecretKey = {
        let mut key = [0; 32];
        key[0] = 1;
        key
    };

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_placement_is_in_range() {
        let netgroup = NetGroupManager::default();
        for i in 0..200 {
            let address = addr(&format!("250.{i}.1.1:8333"));
            let new = new_bucket(&KEY, &netgroup, &address, &ip("252.2.2.2"));
            let tried = tried_bucket(&KEY, &netgroup, &address);

            assert!(new < NEW_BUCKET_COUNT);
            assert!(tried < TRIED_BUCKET_COUNT);
            assert!(bucket_position(&KEY, Table::New, new, &address) < BUCKET_SIZE);
            assert!(bucket_position(&KEY, Table::Tried, tried, &address) < BUCKET_SIZE);
        }
    }

    #[test]
    fn test_tried_buckets_per_group() {
        let netgroup = NetGroupManager::default();

        // same /16, exactly 8 buckets
        let buckets: HashSet<_> = (1..=255)
            .map(|i| tried_bucket(&KEY, &netgroup, &addr(&format!("250.1.1.{i}:8333"))))
            .collect();
        assert_eq!(buckets.len(), 8);

        // many /16s spread further
        let buckets: HashSet<_> = (1..=255)
            .map(|i| tried_bucket(&KEY, &netgroup, &addr(&format!("250.{i}.1.1:8333"))))
            .collect();
        assert!(buckets.len() > 8);
    }

    #[test]
    fn test_new_buckets_per_source() {
        let netgroup = NetGroupManager::default();

        // one address, sources inside one /16: exactly 8 buckets
        let buckets: HashSet<_> = (1..=255)
            .map(|i| {
                new_bucket(
                    &KEY,
                    &netgroup,
                    &addr(&format!("250.1.2.{i}:8333")),
                    &ip(&format!("250.1.1.{i}")),
                )
            })
            .collect();
        assert_eq!(buckets.len(), 8);

        // one source, addresses in one group: a single bucket
        let buckets: HashSet<_> = (1..=255)
            .map(|i| {
                new_bucket(
                    &KEY,
                    &netgroup,
                    &addr(&format!("250.1.2.{i}:8333")),
                    &ip("252.1.1.1"),
                )
            })
            .collect();
        assert_eq!(buckets.len(), 1);

        // sources from many /16s reach a lot more buckets
        let buckets: HashSet<_> = (1..=255)
            .map(|i| {
                new_bucket(
                    &KEY,
                    &netgroup,
                    &addr("250.1.2.1:8333"),
                    &ip(&format!("250.{i}.1.1")),
                )
            })
            .collect();
        assert!(buckets.len() > 8);
    }

    #[test]
    fn test_new_buckets_per_source_group() {
        let netgroup = NetGroupManager::default();

        // a single source group never reaches more than 64 buckets
        let buckets: HashSet<_> = (0..4 * 255)
            .map(|i: u32| {
                new_bucket(
                    &KEY,
                    &netgroup,
                    &addr(&format!("{}.{}.1.1:8333", 1 + i / 255, 1 + i % 255)),
                    &ip(&format!("252.1.{}.{}", i % 255, i % 7)),
                )
            })
            .collect();
        assert!(buckets.len() <= 64);
        assert!(buckets.len() > 8);
    }

    #[test]
    fn test_port_does_not_pick_new_bucket() {
        let netgroup = NetGroupManager::default();
        let source = ip("252.2.2.2");

        assert_eq!(
            new_bucket(&KEY, &netgroup, &addr("250.1.1.1:8333"), &source),
            new_bucket(&KEY, &netgroup, &addr("250.1.1.1:9999"), &source)
        );
    }

    #[test]
    fn test_placement_depends_on_key() {
        let netgroup = NetGroupManager::default();
        let mut other_key = KEY;
        other_key[0] = 2;

        let addresses: Vec<_> = (1..=16)
            .map(|i| addr(&format!("250.{i}.1.1:8333")))
            .collect();

        let new = |key: &SecretKey| -> Vec<usize> {
            addresses
                .iter()
                .map(|address| new_bucket(key, &netgroup, address, &ip("252.2.2.2")))
                .collect()
        };
        let tried = |key: &SecretKey| -> Vec<usize> {
            addresses
                .iter()
                .map(|address| tried_bucket(key, &netgroup, address))
                .collect()
        };
        let positions = |key: &SecretKey| -> Vec<usize> {
            addresses
                .iter()
                .map(|address| bucket_position(key, Table::New, 0, address))
                .collect()
        };

        assert_ne!(new(&KEY), new(&other_key));
        assert_ne!(tried(&KEY), tried(&other_key));
        assert_ne!(positions(&KEY), positions(&other_key));
    }

    #[test]
    fn test_asmap_spreads_tried_buckets() {
        let legacy = NetGroupManager::default();
        let asmap = NetGroupManager::new(Some(test_asmap()));

        // all of 250/8 is a single AS, so it only gets 8 buckets
        let legacy_buckets: HashSet<_> = (1..=255)
            .map(|i| tried_bucket(&KEY, &legacy, &addr(&format!("250.{i}.1.1:8333"))))
            .collect();
        let asmap_buckets: HashSet<_> = (1..=255)
            .map(|i| tried_bucket(&KEY, &asmap, &addr(&format!("250.{i}.1.1:8333"))))
            .collect();

        assert!(legacy_buckets.len() > 8);
        assert_eq!(asmap_buckets.len(), 8);

        let as_buckets: HashSet<_> = (1..=8)
            .flat_map(|n| (1..=32).map(move |i| format!("101.{n}.{i}.1:8333")))
            .map(|address| tried_bucket(&KEY, &asmap, &addr(&address)))
            .collect();
        assert!(as_buckets.len() > 8);
    }

    #[test]
    fn test_bucket_table() {
        let mut table = BucketTable::new(4);
        assert_eq!(table.bucket_count(), 4);
        assert_eq!(table.get(1, 3), None);

        table.set(1, 3, 42);
        table.set(1, 5, 7);
        table.set(3, 0, 9);
        assert_eq!(table.get(1, 3), Some(42));
        assert_eq!(table.entries(1).collect::<Vec<_>>(), vec![42, 7]);
        assert_eq!(
            table.occupied().collect::<Vec<_>>(),
            vec![(1, 3, 42), (1, 5, 7), (3, 0, 9)]
        );

        assert_eq!(table.take(1, 3), Some(42));
        assert_eq!(table.take(1, 3), None);

        table.clear();
        assert_eq!(table.occupied().count(), 0);
    }
}
