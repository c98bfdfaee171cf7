//! K-buckets: one slice of the identifier space and the contacts in it

use crate::contact::{unix_now, Contact};
use crate::id::{NodeId, ID_BITS};
use rand::Rng;

/// A bucket covering the inclusive range `[low, high]`.
///
/// Ranges are power-of-two aligned blocks: the initial bucket spans the whole
/// space and every split halves an aligned block, so `low ^ high` is always an
/// all-ones suffix. Contacts are kept least-recently-seen first.
#[derive(Clone)]
pub struct KBucket {
    low: NodeId,
    high: NodeId,
    contacts: Vec<Contact>,
    capacity: usize,
    touched: u64,
}

impl KBucket {
    /// The bucket covering the whole identifier space
    pub fn full_range(capacity: usize) -> Self {
        Self {
            low: NodeId::zero(),
            high: NodeId::max(),
            contacts: Vec::new(),
            capacity,
            touched: unix_now(),
        }
    }

    /// Reassemble a bucket from snapshot parts
    pub fn from_parts(
        low: NodeId,
        high: NodeId,
        contacts: Vec<Contact>,
        touched: u64,
        capacity: usize,
    ) -> Self {
        Self {
            low,
            high,
            contacts,
            capacity,
            touched,
        }
    }

    pub fn low(&self) -> NodeId {
        self.low
    }

    pub fn high(&self) -> NodeId {
        self.high
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn touched(&self) -> u64 {
        self.touched
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    pub fn contains_id(&self, id: &NodeId) -> bool {
        self.low <= *id && *id <= self.high
    }

    /// Number of range bits that vary within this bucket
    pub fn range_bits(&self) -> u32 {
        let span = self.low ^ self.high;
        debug_assert!(span.is_low_mask(), "bucket range is not aligned");
        ID_BITS - span.leading_zeros()
    }

    /// Length of the binary prefix shared by every id the range can contain
    pub fn depth(&self) -> u32 {
        ID_BITS - self.range_bits()
    }

    /// Uniformly random id inside the range, for refresh lookups
    pub fn random_id_within<R: Rng + ?Sized>(&self, rng: &mut R) -> NodeId {
        NodeId::random_within(self.low, self.high, rng)
    }

    pub(crate) fn touch(&mut self) {
        self.touched = unix_now();
    }

    /// If the contact is already present, move it to the most-recently-seen
    /// end with a fresh timestamp
    pub(crate) fn refresh_existing(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == *id) {
            let mut contact = self.contacts.remove(pos);
            contact.touch();
            self.contacts.push(contact);
            self.touch();
            true
        } else {
            false
        }
    }

    /// Append at the most-recently-seen end; caller checks capacity
    pub(crate) fn append(&mut self, mut contact: Contact) {
        debug_assert!(!self.is_full());
        debug_assert!(self.contains_id(&contact.id));
        contact.touch();
        self.contacts.push(contact);
        self.touch();
    }

    /// The least-recently-seen contact, eviction candidate when full
    pub(crate) fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    pub(crate) fn remove_id(&mut self, id: &NodeId) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|c| c.id != *id);
        self.contacts.len() != before
    }

    /// Split into the lower and upper aligned halves, redistributing contacts
    pub(crate) fn split(self) -> (KBucket, KBucket) {
        let bits = self.range_bits();
        debug_assert!(bits >= 1, "cannot split a single-id bucket");
        let upper_low = self.low | NodeId::from_bit(bits - 1);
        let lower_high = self.low | NodeId::low_mask(bits - 1);

        let (lower_contacts, upper_contacts): (Vec<_>, Vec<_>) = self
            .contacts
            .into_iter()
            .partition(|c| c.id <= lower_high);

        let lower = KBucket {
            low: self.low,
            high: lower_high,
            contacts: lower_contacts,
            capacity: self.capacity,
            touched: self.touched,
        };
        let upper = KBucket {
            low: upper_low,
            high: self.high,
            contacts: upper_contacts,
            capacity: self.capacity,
            touched: self.touched,
        };
        (lower, upper)
    }
}
