//! Candidate pool: the table of in-flight candidate records.
//!
//! Stages never pass documents to each other directly. A stage allocates a
//! [`Ticket`] describing a candidate (its location, optionally its document,
//! and status flags) and hands the ticket up the tree. Whoever decides a
//! candidate is not needed must `release` its ticket, otherwise the slot stays
//! accounted against the pool capacity.
//!
//! Tickets are generation-checked: a released ticket can never alias the
//! candidate that later reuses its slot.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use planstage_core::id::RecordRef;
use planstage_core::types::Document;

use crate::error::{PoolError, Result};
use crate::store::RecordStore;

/// Shared, single-threaded handle to the pool owned by the executor.
pub type PoolHandle = Rc<RefCell<CandidatePool>>;

/// Handle to a pool member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket {
    index: u32,
    generation: u32,
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Candidate state behind a ticket.
#[derive(Debug, Clone, Default)]
pub struct Member {
    loc: Option<RecordRef>,
    doc: Option<Document>,
    flagged: bool,
    unrecoverable: bool,
}

impl Member {
    /// Attached physical location, if the candidate still has one.
    pub fn location(&self) -> Option<RecordRef> {
        self.loc
    }

    pub fn document(&self) -> Option<&Document> {
        self.doc.as_ref()
    }

    /// Set when hash-based verification of this candidate is impossible and
    /// it must be fully re-checked downstream.
    pub fn is_flagged(&self) -> bool {
        self.flagged
    }

    /// Set when the record vanished before its content could be captured.
    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable
    }
}

struct Slot {
    generation: u32,
    member: Option<Member>,
}

pub struct CandidatePool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    peak_live: usize,
    capacity: usize,
}

impl CandidatePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            peak_live: 0,
            capacity,
        }
    }

    /// Wrap a fresh pool in a shareable handle.
    pub fn shared(capacity: usize) -> PoolHandle {
        Rc::new(RefCell::new(Self::new(capacity)))
    }

    /// Allocate a candidate attached to a stored record.
    pub fn allocate(&mut self, loc: RecordRef) -> Result<Ticket> {
        self.insert(Member {
            loc: Some(loc),
            ..Member::default()
        })
    }

    /// Allocate a candidate that owns its document and has no location.
    pub fn allocate_owned(&mut self, doc: Document) -> Result<Ticket> {
        self.insert(Member {
            doc: Some(doc),
            ..Member::default()
        })
    }

    fn insert(&mut self, member: Member) -> Result<Ticket> {
        if self.live >= self.capacity {
            #[cfg(feature = "tracing")]
            tracing::warn!(live = self.live, capacity = self.capacity, "candidate pool full");
            return Err(PoolError::CapacityExceeded {
                capacity: self.capacity,
                live: self.live,
            });
        }

        let ticket = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.member = Some(member);
                Ticket {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    member: Some(member),
                });
                Ticket {
                    index,
                    generation: 0,
                }
            }
        };

        self.live += 1;
        if self.live > self.peak_live {
            self.peak_live = self.live;
            #[cfg(feature = "tracing")]
            tracing::trace!(peak = self.peak_live, "candidate pool peak");
        }
        Ok(ticket)
    }

    pub fn member(&self, ticket: Ticket) -> Result<&Member> {
        self.slots
            .get(ticket.index as usize)
            .filter(|s| s.generation == ticket.generation)
            .and_then(|s| s.member.as_ref())
            .ok_or(PoolError::StaleTicket(ticket))
    }

    fn member_mut(&mut self, ticket: Ticket) -> Result<&mut Member> {
        self.slots
            .get_mut(ticket.index as usize)
            .filter(|s| s.generation == ticket.generation)
            .and_then(|s| s.member.as_mut())
            .ok_or(PoolError::StaleTicket(ticket))
    }

    pub fn location(&self, ticket: Ticket) -> Result<Option<RecordRef>> {
        Ok(self.member(ticket)?.loc)
    }

    pub fn document(&self, ticket: Ticket) -> Result<Option<&Document>> {
        Ok(self.member(ticket)?.doc.as_ref())
    }

    pub fn is_flagged(&self, ticket: Ticket) -> Result<bool> {
        Ok(self.member(ticket)?.flagged)
    }

    /// Load the document for `ticket` from its location, keeping the
    /// location attached. A no-op if the document is already present.
    pub fn fetch(&mut self, ticket: Ticket, store: &dyn RecordStore) -> Result<&Document> {
        let member = self.member_mut(ticket)?;
        if member.doc.is_none() {
            let loc = member.loc.ok_or(PoolError::NotMaterialized(ticket))?;
            let doc = store.fetch(loc).ok_or(PoolError::RecordMissing(loc))?;
            member.doc = Some(doc);
        }
        member.doc.as_ref().ok_or(PoolError::NotMaterialized(ticket))
    }

    /// Capture the record content into the member and detach its location.
    ///
    /// Called right before a location becomes invalid. If the record can no
    /// longer be read the member is marked unrecoverable instead. Returns
    /// whether the member ends up holding a document.
    pub fn materialize_full(&mut self, ticket: Ticket, store: &dyn RecordStore) -> Result<bool> {
        let member = self.member_mut(ticket)?;
        if let Some(loc) = member.loc.take() {
            if member.doc.is_none() {
                match store.fetch(loc) {
                    Some(doc) => member.doc = Some(doc),
                    None => member.unrecoverable = true,
                }
            }
        }
        Ok(member.doc.is_some())
    }

    pub fn flag_for_review(&mut self, ticket: Ticket) -> Result<()> {
        self.member_mut(ticket)?.flagged = true;
        Ok(())
    }

    /// Return a ticket to the pool. The ticket is stale afterwards.
    pub fn release(&mut self, ticket: Ticket) -> Result<()> {
        let slot = self
            .slots
            .get_mut(ticket.index as usize)
            .filter(|s| s.generation == ticket.generation && s.member.is_some())
            .ok_or(PoolError::StaleTicket(ticket))?;
        slot.member = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(ticket.index);
        self.live -= 1;
        Ok(())
    }

    /// Number of tickets currently allocated.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Highest `live_count` observed so far.
    pub fn peak_live(&self) -> usize {
        self.peak_live
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
