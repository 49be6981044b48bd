//! The persisted form of an address manager.
//!
//! Everything is little endian, using the bitcoin consensus encoding:
//!
//! ```text
//! u8        format version
//! u8        key size, always 32
//! [u8; 32]  secret key
//! u32       how many new records follow
//! u32       how many tried records follow
//! u32       the new bucket count, XOR'ed with 1 << 30
//! [u8; 32]  checksum of the ASN map in use, zeros for none (version 2 and up)
//! records   new records, then tried records
//! buckets   for each new bucket: a u32 count, then that many u32 indices into the new records
//! ```
//!
//! New bucket memberships are replayed only if they were computed with the same key, the
//! same grouping and the same bucket count. Otherwise they are recomputed from each
//! record's source. Tried placement is always recomputed.

use std::collections::HashMap;

use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use tracing::debug;
use tracing::warn;

use crate::addr_info::AddrInfo;
use crate::bucket::bucket_position;
use crate::bucket::new_bucket;
use crate::bucket::tried_bucket;
use crate::bucket::Table;
use crate::bucket::BUCKET_SIZE;
use crate::bucket::NEW_BUCKETS_PER_ADDRESS;
use crate::bucket::NEW_BUCKET_COUNT;
use crate::bucket::TRIED_BUCKET_COUNT;
use crate::error::AddrManError;
use crate::manager::AddrMan;
use crate::manager::AddrManInner;

/// The format we write
const FORMAT_VERSION: u8 = 2;

/// The first version carrying the ASN map checksum
const FORMAT_WITH_CHECKSUM: u8 = 2;

const KEY_SIZE: u8 = 32;

/// The bucket count is tagged with this bit, so older readers that don't expect it fail
const BUCKET_COUNT_TAG: u32 = 1 << 30;

/// No sane stream has more buckets than this
const MAX_BUCKET_COUNT: u32 = 1 << 16;

impl AddrManInner {
    pub(crate) fn encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = 0;
        len += FORMAT_VERSION.consensus_encode(writer)?;
        len += KEY_SIZE.consensus_encode(writer)?;
        len += self.key.consensus_encode(writer)?;
        len += (self.n_new as u32).consensus_encode(writer)?;
        len += (self.n_tried as u32).consensus_encode(writer)?;
        let tagged_bucket_count = self.new_table.bucket_count() as u32 ^ BUCKET_COUNT_TAG;
        len += tagged_bucket_count.consensus_encode(writer)?;
        len += self.netgroup.asmap_checksum().consensus_encode(writer)?;

        let mut records: Vec<_> = self.map_info.iter().collect();
        records.sort_unstable_by_key(|(id, _)| **id);

        // buckets refer to new records by their position in the stream
        let mut indices = HashMap::new();
        for (id, info) in records.iter().filter(|(_, info)| info.ref_count > 0) {
            indices.insert(**id, indices.len() as u32);
            len += info.consensus_encode(writer)?;
        }

        for (_, info) in records.iter().filter(|(_, info)| info.in_tried) {
            len += info.consensus_encode(writer)?;
        }

        for bucket in 0..self.new_table.bucket_count() {
            let entries: Vec<u32> = self
                .new_table
                .entries(bucket)
                .filter_map(|id| indices.get(&id).copied())
                .collect();

            len += (entries.len() as u32).consensus_encode(writer)?;
            for index in entries {
                len += index.consensus_encode(writer)?;
            }
        }

        Ok(len)
    }

    /// Adds a record straight from a stream, not referenced by any table
    fn insert_decoded(&mut self, id: usize, mut info: AddrInfo) -> Result<(), AddrManError> {
        if self.map_addr.contains_key(&info.addr) {
            return Err(AddrManError::Inconsistent("duplicated address in the stream"));
        }

        info.random_pos = self.random.len();
        self.map_addr.insert(info.addr, id);
        self.map_info.insert(id, info);
        self.random.push(id);

        Ok(())
    }

    /// Decodes a stream into this manager, which must be empty. On failure, whatever was
    /// decoded so far stays here.
    pub(crate) fn decode<R: bitcoin::io::Read + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<(), AddrManError> {
        let version = u8::consensus_decode(reader)?;
        if version > FORMAT_VERSION {
            return Err(AddrManError::UnsupportedVersion(version));
        }

        let key_size = u8::consensus_decode(reader)?;
        if key_size != KEY_SIZE {
            return Err(AddrManError::InvalidKeySize(key_size));
        }

        self.key = <[u8; 32]>::consensus_decode(reader)?;
        let n_new = u32::consensus_decode(reader)?;
        let n_tried = u32::consensus_decode(reader)?;

        let tagged_bucket_count = u32::consensus_decode(reader)?;
        if tagged_bucket_count & BUCKET_COUNT_TAG == 0 {
            return Err(AddrManError::CorruptedBucketCount(tagged_bucket_count));
        }

        let bucket_count = tagged_bucket_count ^ BUCKET_COUNT_TAG;
        if bucket_count > MAX_BUCKET_COUNT {
            return Err(AddrManError::CorruptedBucketCount(tagged_bucket_count));
        }

        let checksum = match version >= FORMAT_WITH_CHECKSUM {
            true => Some(<[u8; 32]>::consensus_decode(reader)?),
            false => None,
        };

        if n_new as usize > NEW_BUCKET_COUNT * BUCKET_SIZE {
            return Err(AddrManError::TooManyEntries {
                table: "new",
                count: n_new,
            });
        }

        if n_tried as usize > TRIED_BUCKET_COUNT * BUCKET_SIZE {
            return Err(AddrManError::TooManyEntries {
                table: "tried",
                count: n_tried,
            });
        }

        for index in 0..n_new as usize {
            let info = AddrInfo::consensus_decode(reader)?;
            self.insert_decoded(index, info)?;
        }

        self.next_id = n_new as usize;

        let mut demoted = 0;
        for _ in 0..n_tried {
            let info = AddrInfo::consensus_decode(reader)?;
            let bucket = tried_bucket(&self.key, &self.netgroup, &info.addr);
            let position = bucket_position(&self.key, Table::Tried, bucket, &info.addr);

            let id = self.next_id;
            self.next_id += 1;
            self.insert_decoded(id, info)?;

            // it'll look for a place in the new table below
            if self.tried_table.get(bucket, position).is_some() {
                demoted += 1;
                continue;
            }

            self.tried_table.set(bucket, position, id);
            if let Some(info) = self.map_info.get_mut(&id) {
                info.in_tried = true;
            }
        }

        let restore_buckets = checksum == Some(self.netgroup.asmap_checksum())
            && bucket_count as usize == self.new_table.bucket_count();

        for bucket in 0..bucket_count as usize {
            let entries = u32::consensus_decode(reader)?;
            for _ in 0..entries {
                let index = u32::consensus_decode(reader)?;
                if index >= n_new {
                    return Err(AddrManError::InvalidBucketEntry(index));
                }

                if !restore_buckets {
                    continue;
                }

                let id = index as usize;
                let Some(info) = self.map_info.get_mut(&id) else {
                    continue;
                };

                if info.ref_count >= NEW_BUCKETS_PER_ADDRESS {
                    continue;
                }

                let position = bucket_position(&self.key, Table::New, bucket, &info.addr);
                if self.new_table.get(bucket, position).is_none() {
                    info.ref_count += 1;
                    self.new_table.set(bucket, position, id);
                }
            }
        }

        if !restore_buckets {
            debug!("Bucketing changed since this stream was written, recomputing the new table");
        }

        // everyone that didn't get a slot yet tries the one given by its own source
        let mut homeless: Vec<usize> = self
            .map_info
            .iter()
            .filter(|(_, info)| !info.in_tried && info.ref_count == 0)
            .map(|(id, _)| *id)
            .collect();
        homeless.sort_unstable();

        let mut lost = 0;
        for id in homeless {
            let Some(info) = self.map_info.get_mut(&id) else {
                continue;
            };

            let bucket = new_bucket(&self.key, &self.netgroup, &info.addr, &info.source);
            let position = bucket_position(&self.key, Table::New, bucket, &info.addr);

            if self.new_table.get(bucket, position).is_none() {
                info.ref_count = 1;
                self.new_table.set(bucket, position, id);
                continue;
            }

            self.delete(id);
            lost += 1;
        }

        self.n_new = self
            .map_info
            .values()
            .filter(|info| info.ref_count > 0)
            .count();
        self.n_tried = self.map_info.values().filter(|info| info.in_tried).count();

        if demoted > 0 {
            debug!("{demoted} tried addresses collided while loading, moved them to new");
        }

        if lost > 0 {
            warn!("Lost {lost} addresses while loading, there was no room for them");
        }

        debug!(
            "Loaded {} addresses: {} new, {} tried",
            self.size(),
            self.n_new,
            self.n_tried
        );

        Ok(())
    }
}

impl Encodable for AddrMan {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        self.inner.lock().encode(writer)
    }
}

impl AddrMan {
    /// Replaces our state with the one in `reader`, in place.
    ///
    /// If the stream turns out to be broken, the error is returned but the addresses read
    /// up to that point are kept, and the manager may be left inconsistent. Use
    /// [`read_checked`](AddrMan::read_checked) unless you really want this.
    pub fn unserialize<R: bitcoin::io::Read + ?Sized>(
        &self,
        reader: &mut R,
    ) -> Result<(), AddrManError> {
        let mut inner = self.inner.lock();
        inner.clear();
        inner.decode(reader)
    }

    /// Replaces our state with the one in `reader`, but only if it decodes completely.
    /// On failure, this manager is left untouched.
    pub fn read_checked<R: bitcoin::io::Read + ?Sized>(
        &self,
        reader: &mut R,
    ) -> Result<(), AddrManError> {
        let mut scratch = self.inner.lock().empty_like();
        scratch.decode(reader)?;
        scratch.check()?;

        *self.inner.lock() = scratch;
        Ok(())
    }
}
