//! The bucket list: a contiguous, sorted cover of the identifier space
//!
//! All mutation goes through one writer lock. The only operation that talks
//! to the network, pinging an eviction candidate, drops the lock first and
//! re-finds the bucket afterwards, so no lock is ever held across an RPC.

use super::bucket::KBucket;
use crate::contact::Contact;
use crate::id::NodeId;
use tokio::sync::RwLock;
use tracing::debug;

/// What happened to an inserted contact
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// Appended as a new contact
    Added,
    /// Was already present; moved to the most-recently-seen end
    Refreshed,
    /// Bucket full and its least-recently-seen contact answered a ping; the
    /// newcomer is handed back for the pending queue
    Deferred(Contact),
    /// Our own id is never inserted
    Ignored,
}

/// Routing table for one node
pub struct BucketList {
    owner: Contact,
    k: usize,
    split_depth_modulus: u32,
    buckets: RwLock<Vec<KBucket>>,
}

impl BucketList {
    pub fn new(owner: Contact, k: usize, split_depth_modulus: u32) -> Self {
        Self {
            owner,
            k,
            split_depth_modulus,
            buckets: RwLock::new(vec![KBucket::full_range(k)]),
        }
    }

    /// Reassemble from snapshot buckets
    pub fn restore(
        owner: Contact,
        k: usize,
        split_depth_modulus: u32,
        buckets: Vec<KBucket>,
    ) -> Self {
        debug_assert!(!buckets.is_empty());
        Self {
            owner,
            k,
            split_depth_modulus,
            buckets: RwLock::new(buckets),
        }
    }

    pub fn owner_id(&self) -> NodeId {
        self.owner.id
    }

    fn index_of(buckets: &[KBucket], id: &NodeId) -> usize {
        // buckets are sorted by range; the first bucket starts at zero
        let idx = buckets.partition_point(|b| b.low() <= *id) - 1;
        debug_assert!(buckets[idx].contains_id(id));
        idx
    }

    /// Insert or refresh a contact per the Kademlia discipline: refresh in
    /// place, append while there is room, split while eligible, otherwise
    /// ping the least-recently-seen contact and evict it only if it fails
    /// to answer.
    pub async fn add_contact(&self, contact: Contact) -> AddOutcome {
        if contact.id == self.owner.id {
            return AddOutcome::Ignored;
        }

        loop {
            let candidate = {
                let mut buckets = self.buckets.write().await;
                let idx = Self::index_of(&buckets, &contact.id);

                if buckets[idx].refresh_existing(&contact.id) {
                    return AddOutcome::Refreshed;
                }
                if !buckets[idx].is_full() {
                    buckets[idx].append(contact);
                    return AddOutcome::Added;
                }
                if self.can_split(&buckets[idx]) {
                    let bucket = buckets.remove(idx);
                    let (lower, upper) = bucket.split();
                    buckets.insert(idx, upper);
                    buckets.insert(idx, lower);
                    continue;
                }

                match buckets[idx].least_recently_seen() {
                    Some(lru) => lru.clone(),
                    None => {
                        // capacity zero is not constructible, but stay safe
                        return AddOutcome::Deferred(contact);
                    }
                }
            };

            // lock released: probe the eviction candidate
            let alive = candidate
                .protocol
                .ping(self.owner.clone())
                .await
                .is_ok();

            let mut buckets = self.buckets.write().await;
            let idx = Self::index_of(&buckets, &contact.id);

            if alive {
                buckets[idx].refresh_existing(&candidate.id);
                debug!(kept = %candidate.id, deferred = %contact.id, "eviction candidate answered");
                return AddOutcome::Deferred(contact);
            }

            buckets[idx].remove_id(&candidate.id);
            debug!(evicted = %candidate.id, "eviction candidate timed out");
            if !buckets[idx].is_full() {
                buckets[idx].append(contact);
                return AddOutcome::Added;
            }
            // the bucket refilled while we pinged; go around again
        }
    }

    fn can_split(&self, bucket: &KBucket) -> bool {
        bucket.contains_id(&self.owner.id) || bucket.depth() % self.split_depth_modulus != 0
    }

    /// Up to k contacts across the whole table, ascending by XOR distance to
    /// `key`, omitting `exclude`
    pub async fn close_contacts(&self, key: &NodeId, exclude: Option<NodeId>) -> Vec<Contact> {
        let buckets = self.buckets.read().await;
        let mut all: Vec<Contact> = buckets
            .iter()
            .flat_map(|b| b.contacts().iter().cloned())
            .filter(|c| Some(c.id) != exclude)
            .collect();
        all.sort_by_key(|c| c.id.distance(key));
        all.truncate(self.k);
        all
    }

    /// Every contact in the table
    pub async fn contacts(&self) -> Vec<Contact> {
        let buckets = self.buckets.read().await;
        buckets
            .iter()
            .flat_map(|b| b.contacts().iter().cloned())
            .collect()
    }

    pub async fn contact_exists(&self, id: &NodeId) -> bool {
        let buckets = self.buckets.read().await;
        let idx = Self::index_of(&buckets, id);
        buckets[idx].contacts().iter().any(|c| c.id == *id)
    }

    pub async fn remove_contact(&self, id: &NodeId) -> bool {
        let mut buckets = self.buckets.write().await;
        let idx = Self::index_of(&buckets, id);
        buckets[idx].remove_id(id)
    }

    /// The unique bucket whose range contains `key`, as a snapshot
    pub async fn get_kbucket(&self, key: &NodeId) -> KBucket {
        let buckets = self.buckets.read().await;
        buckets[Self::index_of(&buckets, key)].clone()
    }

    /// Snapshot of every bucket, for refresh sweeps and saves
    pub async fn snapshot(&self) -> Vec<KBucket> {
        self.buckets.read().await.clone()
    }

    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Refresh a bucket's touch timestamp after a refresh lookup
    pub(crate) async fn mark_refreshed(&self, key: &NodeId) {
        let mut buckets = self.buckets.write().await;
        let idx = Self::index_of(&buckets, key);
        buckets[idx].touch();
    }
}
