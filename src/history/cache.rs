//! The negative-lookup cache.
//!
//! A fixed-size, direct-mapped table of `(hash, seen?)` answers consulted
//! by `check` before the index is touched. Collisions overwrite; newest
//! wins. The cache may claim an identifier is unknown when it is not (the
//! index then answers), but a positive answer is only ever cached from a
//! real index hit, so it never invents an article.

use crate::msgid::MessageIdHash;

#[derive(Clone, Copy)]
struct CacheSlot {
    hash: MessageIdHash,
    found: bool,
}

/// Bytes per slot; cache sizes given in bytes are divided by this.
pub const SLOT_SIZE: usize = std::mem::size_of::<CacheSlot>();

pub(crate) enum CacheAnswer {
    /// Cached: the identifier is in the database.
    Hit,
    /// Cached: the identifier is not in the database.
    Miss,
    /// Not cached; ask the index.
    Unknown,
}

pub(crate) struct LookupCache {
    slots: Vec<Option<CacheSlot>>,
}

impl LookupCache {
    pub fn disabled() -> Self {
        LookupCache { slots: Vec::new() }
    }

    /// A cache of `bytes / SLOT_SIZE` slots; zero bytes disables caching.
    pub fn sized(bytes: usize) -> Self {
        LookupCache { slots: vec![None; bytes / SLOT_SIZE] }
    }

    fn slot(&self, hash: &MessageIdHash) -> usize {
        let bytes = hash.as_bytes();
        let tail = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        tail as usize % self.slots.len()
    }

    pub fn lookup(&self, hash: &MessageIdHash) -> CacheAnswer {
        if self.slots.is_empty() {
            return CacheAnswer::Unknown;
        }
        match &self.slots[self.slot(hash)] {
            Some(slot) if slot.hash == *hash => {
                if slot.found {
                    CacheAnswer::Hit
                } else {
                    CacheAnswer::Miss
                }
            }
            _ => CacheAnswer::Unknown,
        }
    }

    pub fn add(&mut self, hash: &MessageIdHash, found: bool) {
        if self.slots.is_empty() {
            return;
        }
        let index = self.slot(hash);
        self.slots[index] = Some(CacheSlot { hash: *hash, found });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(tail: u32, lead: u8) -> MessageIdHash {
        let mut bytes = [0u8; 16];
        bytes[0] = lead;
        bytes[12..16].copy_from_slice(&tail.to_le_bytes());
        MessageIdHash::from_bytes(bytes)
    }

    #[test]
    fn disabled_cache_answers_unknown() {
        let cache = LookupCache::disabled();
        assert!(matches!(cache.lookup(&hash(1, 1)), CacheAnswer::Unknown));
    }

    #[test]
    fn remembers_both_polarities() {
        let mut cache = LookupCache::sized(64 * SLOT_SIZE);
        cache.add(&hash(1, 1), true);
        cache.add(&hash(2, 2), false);
        assert!(matches!(cache.lookup(&hash(1, 1)), CacheAnswer::Hit));
        assert!(matches!(cache.lookup(&hash(2, 2)), CacheAnswer::Miss));
        assert!(matches!(cache.lookup(&hash(3, 3)), CacheAnswer::Unknown));
    }

    #[test]
    fn collision_overwrites_and_never_lies() {
        let mut cache = LookupCache::sized(8 * SLOT_SIZE);
        let slots = 8;
        // same slot, different hashes
        let first = hash(5, 1);
        let second = hash(5 + slots as u32, 2);
        cache.add(&first, true);
        cache.add(&second, false);
        // the evicted entry is unknown, not wrong
        assert!(matches!(cache.lookup(&first), CacheAnswer::Unknown));
        assert!(matches!(cache.lookup(&second), CacheAnswer::Miss));
    }
}
