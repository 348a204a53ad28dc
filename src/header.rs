use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use modular_bitfield::prelude::*;
use parking_lot::RwLock;

use crate::object::ObjectRef;

/// Per-object liveness and forwarding state as seen by collection algorithms.
///
/// Algorithms only go through this accessor; how the state is encoded is up to
/// the implementation.
pub trait CollectionMetadata: Send + Sync {
    fn is_marked(&self, object: ObjectRef) -> bool;
    /// Marks `object`. Returns `true` if this call set the mark.
    fn set_mark(&self, object: ObjectRef) -> bool;
    fn forward_target(&self, object: ObjectRef) -> Option<ObjectRef>;
    fn set_forward_target(&self, object: ObjectRef, target: ObjectRef);
    /// Invalidates every mark and forwarding pointer. Invoked at the start of each cycle.
    fn begin_cycle(&self);
    /// Drops state kept for an object that has been freed.
    fn forget(&self, object: ObjectRef) {
        let _ = object;
    }
}

// HeaderWord is the packed per-object word kept by `SideTableMetadata`.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | mark            |    1 | Marked iff equal to the current polarity |
// | forwarded       |    1 |                                          |
// | target          |   62 | Forward target address >> 3              |
// +-----------------+------+------------------------------------------+
//
// Notes:
// - Polarity flips every cycle so marks never have to be cleared.
// - Forward targets must be `ObjectRef::ALIGNMENT` aligned.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
struct HeaderWord {
    mark: bool,
    forwarded: bool,
    target: B62,
}

const TARGET_SHIFT: u32 = ObjectRef::ALIGNMENT.trailing_zeros();

/// [`CollectionMetadata`] kept in a side table of packed header words.
pub struct SideTableMetadata {
    words: RwLock<HashMap<ObjectRef, HeaderWord>>,
    polarity: AtomicBool,
}

impl SideTableMetadata {
    pub fn new() -> Self {
        Self {
            words: RwLock::new(HashMap::new()),
            polarity: AtomicBool::new(true),
        }
    }

    #[inline(always)]
    fn polarity(&self) -> bool {
        self.polarity.load(Ordering::Acquire)
    }

    /// Number of objects that have a word in the table.
    pub fn len(&self) -> usize {
        self.words.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SideTableMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionMetadata for SideTableMetadata {
    fn is_marked(&self, object: ObjectRef) -> bool {
        let polarity = self.polarity();
        self.words
            .read()
            .get(&object)
            .map(|word| word.mark() == polarity)
            .unwrap_or(false)
    }

    fn set_mark(&self, object: ObjectRef) -> bool {
        let polarity = self.polarity();
        let mut words = self.words.write();
        // fresh words start with the opposite polarity so they read as unmarked
        let word = words
            .entry(object)
            .or_insert_with(|| HeaderWord::new().with_mark(!polarity));
        if word.mark() == polarity {
            return false;
        }
        word.set_mark(polarity);
        true
    }

    fn forward_target(&self, object: ObjectRef) -> Option<ObjectRef> {
        self.words.read().get(&object).and_then(|word| {
            if word.forwarded() {
                Some(ObjectRef::from_address(
                    (word.target() as usize) << TARGET_SHIFT,
                ))
            } else {
                None
            }
        })
    }

    fn set_forward_target(&self, object: ObjectRef, target: ObjectRef) {
        debug_assert!(crate::util::is_aligned(
            target.address(),
            ObjectRef::ALIGNMENT
        ));
        let polarity = self.polarity();
        let mut words = self.words.write();
        let word = words
            .entry(object)
            .or_insert_with(|| HeaderWord::new().with_mark(!polarity));
        word.set_forwarded(true);
        word.set_target((target.address() >> TARGET_SHIFT) as u64);
    }

    fn begin_cycle(&self) {
        let mut words = self.words.write();
        let previous = self.polarity();
        for word in words.values_mut() {
            // marked words become unmarked by the flip, unmarked ones must not become marked
            if word.mark() != previous {
                word.set_mark(previous);
            }
            word.set_forwarded(false);
            word.set_target(0);
        }
        self.polarity.store(!previous, Ordering::Release);
    }

    fn forget(&self, object: ObjectRef) {
        self.words.write().remove(&object);
    }
}
