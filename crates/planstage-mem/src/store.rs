//! Record storage seen through physical locations.
//!
//! The executor never owns storage. Stages and the candidate pool look
//! records up through the [`RecordStore`] trait; [`MemoryRecordStore`] is the
//! in-memory implementation used by tests, benches and embedded callers.

use std::cell::RefCell;

use planstage_core::id::RecordRef;
use planstage_core::types::Document;

/// Location-addressed read access to stored records.
pub trait RecordStore {
    /// Look up the record at `loc`. Returns `None` if the location was
    /// invalidated (record deleted or moved).
    fn fetch(&self, loc: RecordRef) -> Option<Document>;

    /// All currently valid locations, in slot order.
    fn live_refs(&self) -> Vec<RecordRef>;
}

struct Slot {
    generation: u32,
    doc: Option<Document>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    fn resolve(&self, loc: RecordRef) -> Option<&Slot> {
        self.slots
            .get(loc.slot() as usize)
            .filter(|s| s.generation == loc.generation() && s.doc.is_some())
    }

    fn resolve_mut(&mut self, loc: RecordRef) -> Option<&mut Slot> {
        self.slots
            .get_mut(loc.slot() as usize)
            .filter(|s| s.generation == loc.generation() && s.doc.is_some())
    }

    fn insert(&mut self, doc: Document) -> RecordRef {
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.doc = Some(doc);
            return RecordRef::new(idx, slot.generation);
        }
        let idx = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            doc: Some(doc),
        });
        RecordRef::new(idx, 0)
    }

    fn remove(&mut self, loc: RecordRef) -> Option<Document> {
        let slot = self.resolve_mut(loc)?;
        let doc = slot.doc.take();
        // Any RecordRef still pointing here is now stale.
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(loc.slot());
        self.live -= 1;
        doc
    }
}

/// Generation-checked slot arena of documents.
///
/// Single-threaded: mutation goes through `&self` so the store can be shared
/// (`Rc<MemoryRecordStore>`) between the executor and its stages.
#[derive(Default)]
pub struct MemoryRecordStore {
    arena: RefCell<Arena>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a document and return its location.
    pub fn insert(&self, doc: Document) -> RecordRef {
        self.arena.borrow_mut().insert(doc)
    }

    /// Delete the record at `loc`, invalidating the location.
    pub fn delete(&self, loc: RecordRef) -> Option<Document> {
        self.arena.borrow_mut().remove(loc)
    }

    /// Overwrite the record at `loc` without moving it. The location stays
    /// valid. Returns `false` if `loc` is stale.
    pub fn update_in_place(&self, loc: RecordRef, doc: Document) -> bool {
        match self.arena.borrow_mut().resolve_mut(loc) {
            Some(slot) => {
                slot.doc = Some(doc);
                true
            }
            None => false,
        }
    }

    /// Move the record at `loc` to a new location holding `doc`. The old
    /// location is invalidated.
    pub fn relocate(&self, loc: RecordRef, doc: Document) -> Option<RecordRef> {
        let mut arena = self.arena.borrow_mut();
        arena.remove(loc)?;
        Some(arena.insert(doc))
    }

    pub fn contains(&self, loc: RecordRef) -> bool {
        self.arena.borrow().resolve(loc).is_some()
    }

    pub fn len(&self) -> usize {
        self.arena.borrow().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn fetch(&self, loc: RecordRef) -> Option<Document> {
        self.arena.borrow().resolve(loc).and_then(|s| s.doc.clone())
    }

    fn live_refs(&self) -> Vec<RecordRef> {
        self.arena
            .borrow()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.doc.is_some())
            .map(|(idx, s)| RecordRef::new(idx as u32, s.generation))
            .collect()
    }
}
