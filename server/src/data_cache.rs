//! Game data caches.
//!
//! Both ends of a session keep two 256-slot caches of recent input payloads,
//! one per direction. A payload already in the cache is sent as its one-byte
//! slot index instead of in full. Slots are filled round-robin, so both ends
//! stay in lockstep as long as they insert the same payloads in the same order.

pub const CACHE_SLOTS: usize = 256;

#[derive(Debug, Clone)]
pub struct GameDataCache {
    slots: Vec<Option<Vec<u8>>>,
    next: usize,
}

impl Default for GameDataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GameDataCache {
    pub fn new() -> Self {
        Self {
            slots: vec![None; CACHE_SLOTS],
            next: 0,
        }
    }

    /// Slot holding `data`, if any.
    pub fn find(&self, data: &[u8]) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| slot.as_deref() == Some(data))
            .map(|index| index as u8)
    }

    pub fn get(&self, key: u8) -> Option<&[u8]> {
        self.slots[key as usize].as_deref()
    }

    /// Stores `data` in the next slot, evicting whatever was there.
    pub fn insert(&mut self, data: Vec<u8>) -> u8 {
        let key = self.next;
        self.slots[key] = Some(data);
        self.next = (self.next + 1) % CACHE_SLOTS;
        key as u8
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.next = 0;
    }
}

/// The pair of caches one session keeps.
#[derive(Debug, Clone, Default)]
pub struct SessionCaches {
    /// Payloads received from the client.
    pub inbound: GameDataCache,
    /// Payloads sent to the client.
    pub outbound: GameDataCache,
}

impl SessionCaches {
    pub fn reset(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let mut cache = GameDataCache::new();
        assert_eq!(cache.find(&[1, 2]), None);
        assert_eq!(cache.insert(vec![1, 2]), 0);
        assert_eq!(cache.insert(vec![3, 4]), 1);
        assert_eq!(cache.find(&[3, 4]), Some(1));
        assert_eq!(cache.get(0), Some(&[1u8, 2][..]));
        assert_eq!(cache.get(9), None);
    }

    #[test]
    fn test_slots_wrap_round_robin() {
        let mut cache = GameDataCache::new();
        for i in 0..CACHE_SLOTS {
            cache.insert(vec![(i % 256) as u8, (i / 256) as u8]);
        }
        assert_eq!(cache.insert(vec![0xAA]), 0);
        assert_eq!(cache.find(&[0, 0]), None);
        assert_eq!(cache.get(0), Some(&[0xAAu8][..]));
        assert_eq!(cache.find(&[1, 0]), Some(1));
    }

    #[test]
    fn test_clear() {
        let mut caches = SessionCaches::default();
        caches.inbound.insert(vec![1]);
        caches.outbound.insert(vec![2]);
        caches.reset();
        assert_eq!(caches.inbound.find(&[1]), None);
        assert_eq!(caches.outbound.insert(vec![3]), 0);
    }
}
