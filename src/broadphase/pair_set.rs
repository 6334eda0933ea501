//! A hash set specialized for unordered pairs of proxy ids.

/// Multiplier of the second id in [`Pair::hash`].
const HASH_PRIME: u32 = 2281;
/// Capacity the set never shrinks below, unless configured otherwise.
pub const DEFAULT_MINIMUM_CAPACITY: usize = 16384;

/// An unordered pair of ids, stored with the smaller id first
/// so that `Pair::new(a, b) == Pair::new(b, a)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pair {
    pub id1: u32,
    pub id2: u32,
}

impl Pair {
    #[inline]
    pub fn new(a: u32, b: u32) -> Self {
        debug_assert_ne!(a, b, "Tried to pair an id with itself");
        if a < b {
            Self { id1: a, id2: b }
        } else {
            Self { id1: b, id2: a }
        }
    }

    /// Both ids packed into one integer.
    ///
    /// Never zero because the ids are distinct,
    /// which lets zero mark empty slots in the set.
    #[inline]
    pub fn key(&self) -> u64 {
        (self.id1 as u64) << 32 | self.id2 as u64
    }

    #[inline]
    fn from_key(key: u64) -> Self {
        Self {
            id1: (key >> 32) as u32,
            id2: key as u32,
        }
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.id1.wrapping_add(HASH_PRIME.wrapping_mul(self.id2)) & 0x7FFF_FFFF
    }
}

/// Open-addressing hash set of [`Pair`]s with linear probing.
///
/// Grows when it becomes half full and shrinks when it's less than an eighth full,
/// so lookups stay short and memory follows the number of pairs.
#[derive(Clone, Debug)]
pub struct PairHashSet {
    slots: Vec<u64>,
    len: usize,
    minimum_capacity: usize,
}

impl Default for PairHashSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PairHashSet {
    pub fn new() -> Self {
        Self::with_minimum_capacity(DEFAULT_MINIMUM_CAPACITY)
    }

    /// Create a set that never shrinks below the given capacity.
    /// The capacity is rounded up to a power of two.
    pub fn with_minimum_capacity(minimum_capacity: usize) -> Self {
        let minimum_capacity = minimum_capacity.max(4).next_power_of_two();
        Self {
            slots: vec![0; minimum_capacity],
            len: 0,
            minimum_capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots currently allocated.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn home_slot(&self, key: u64) -> usize {
        Pair::from_key(key).hash() as usize & (self.slots.len() - 1)
    }

    /// Slot index of the key, or the empty slot where it would go.
    fn find_slot(&self, key: u64) -> usize {
        let mask = self.slots.len() - 1;
        let mut idx = self.home_slot(key);
        // load factor is kept at or below one half so an empty slot always exists
        while self.slots[idx] != 0 && self.slots[idx] != key {
            idx = (idx + 1) & mask;
        }
        idx
    }

    pub fn contains(&self, pair: Pair) -> bool {
        let key = pair.key();
        self.slots[self.find_slot(key)] == key
    }

    /// Add a pair to the set. Returns false if it was already there.
    pub fn add(&mut self, pair: Pair) -> bool {
        let key = pair.key();
        let idx = self.find_slot(key);
        if self.slots[idx] == key {
            return false;
        }
        self.slots[idx] = key;
        self.len += 1;

        if self.len > self.slots.len() / 2 {
            self.resize(self.slots.len() * 2);
        }
        true
    }

    /// Remove a pair from the set. Returns false if it wasn't there.
    pub fn remove(&mut self, pair: Pair) -> bool {
        let key = pair.key();
        let mut hole = self.find_slot(key);
        if self.slots[hole] != key {
            return false;
        }

        // shift later entries of the probe sequence back into the hole
        // so that lookups never stop early at it
        let mask = self.slots.len() - 1;
        let mut j = hole;
        loop {
            j = (j + 1) & mask;
            let entry = self.slots[j];
            if entry == 0 {
                break;
            }
            let home = self.home_slot(entry);
            // an entry can move into the hole unless its home slot
            // is cyclically between the hole and its current slot
            let movable = if j > hole {
                home <= hole || home > j
            } else {
                home <= hole && home > j
            };
            if movable {
                self.slots[hole] = entry;
                hole = j;
            }
        }
        self.slots[hole] = 0;
        self.len -= 1;

        if self.len < self.slots.len() / 8 && self.slots.len() > self.minimum_capacity {
            self.resize(self.slots.len() / 2);
        }
        true
    }

    /// Remove every pair, keeping the current capacity.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = 0);
        self.len = 0;
    }

    /// Iterate over the pairs in the set in no particular order.
    pub fn iter(&self) -> impl '_ + Iterator<Item = Pair> {
        self.slots
            .iter()
            .filter(|key| **key != 0)
            .map(|key| Pair::from_key(*key))
    }

    fn resize(&mut self, new_capacity: usize) {
        log::trace!(
            "Resizing pair set from {} to {} slots",
            self.slots.len(),
            new_capacity
        );
        let old_slots = std::mem::replace(&mut self.slots, vec![0; new_capacity]);
        for key in old_slots.into_iter().filter(|key| *key != 0) {
            let idx = self.find_slot(key);
            self.slots[idx] = key;
        }
    }
}
