//! Iterative lookups over the overlay
//!
//! Both routers run the same algorithm: start from the closest contacts we
//! know, query alpha of them, classify every contact they return as closer or
//! further than the queried node was to the key, and keep widening until the
//! k-closest set stops improving or a FIND_VALUE hits. The serial router
//! issues one RPC at a time; the parallel router feeds a fixed worker pool.

mod parallel;
mod serial;

pub use parallel::ParallelRouter;
pub use serial::SerialRouter;

use crate::contact::Contact;
use crate::error::Result;
use crate::id::NodeId;
use crate::node::Node;
use crate::protocol::FindValueReply;
use async_trait::async_trait;
use std::sync::Arc;

/// Which RPC a lookup drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    FindValue,
}

/// Outcome of a lookup
#[derive(Debug, Clone, Default)]
pub struct LookupResult {
    pub found: bool,
    /// Up to k contacts, ascending by XOR distance to the key
    pub contacts: Vec<Contact>,
    /// The contact the value came from, when found
    pub found_by: Option<Contact>,
    pub value: Option<Vec<u8>>,
}

/// Lookup driver contract
#[async_trait]
pub trait Router: Send + Sync {
    async fn lookup(&self, node: &Arc<Node>, key: NodeId, kind: LookupKind)
        -> Result<LookupResult>;

    /// Stop background machinery; a no-op for stateless routers
    async fn shutdown(&self) {}
}

/// Issue one RPC of the given kind and observe the callee on success.
/// Returns the contacts learned and the value, if any.
pub(crate) async fn issue_rpc(
    node: &Arc<Node>,
    kind: LookupKind,
    key: NodeId,
    target: &Contact,
) -> Result<(Vec<Contact>, Option<Vec<u8>>)> {
    let sender = node.our_contact().clone();
    let outcome = match kind {
        LookupKind::FindNode => target
            .protocol
            .find_node(sender, key)
            .await
            .map(|contacts| (contacts, None)),
        LookupKind::FindValue => {
            target
                .protocol
                .find_value(sender, key)
                .await
                .map(|reply| match reply {
                    FindValueReply::Value(value) => (Vec::new(), Some(value)),
                    FindValueReply::Contacts(contacts) => (contacts, None),
                })
        }
    };

    if outcome.is_ok() {
        node.observe(target.clone()).await;
    }
    outcome
}

/// Fold the contacts one queried node returned into the closer/further sets.
///
/// Each new contact C is compared against the queried node's own distance to
/// the key: `C xor N < N xor key` files it under closer, anything else under
/// further. Ourselves, the queried node, and already-seen contacts are
/// skipped.
pub(crate) fn classify_returned(
    our_id: NodeId,
    key: NodeId,
    queried: &Contact,
    returned: Vec<Contact>,
    closer: &mut Vec<Contact>,
    further: &mut Vec<Contact>,
) {
    let queried_distance = queried.id.distance(&key);
    for contact in returned {
        if contact.id == our_id || contact.id == queried.id {
            continue;
        }
        if closer.iter().any(|c| c.id == contact.id)
            || further.iter().any(|c| c.id == contact.id)
        {
            continue;
        }
        if contact.id.distance(&queried.id) < queried_distance {
            closer.push(contact);
        } else {
            further.push(contact);
        }
    }
}

/// Seed the closer/further sets from the initial candidates. The first alpha go
/// in by their own distance relative to ours; the rest wait in further.
/// Returns the first wave to query.
pub(crate) fn seed_candidates(
    our_id: NodeId,
    key: NodeId,
    alpha: usize,
    all: &[Contact],
    closer: &mut Vec<Contact>,
    further: &mut Vec<Contact>,
) -> Vec<Contact> {
    let our_distance = our_id.distance(&key);
    let wave: Vec<Contact> = all.iter().take(alpha).cloned().collect();
    for contact in &wave {
        if contact.id.distance(&key) < our_distance {
            closer.push(contact.clone());
        } else {
            further.push(contact.clone());
        }
    }
    for contact in all.iter().skip(alpha) {
        further.push(contact.clone());
    }
    wave
}

/// Dedup by id, sort ascending by distance to `key`, keep at most k
pub(crate) fn k_closest(contacts: Vec<Contact>, key: &NodeId, k: usize) -> Vec<Contact> {
    let mut unique: Vec<Contact> = Vec::with_capacity(contacts.len());
    for contact in contacts {
        if !unique.iter().any(|c| c.id == contact.id) {
            unique.push(contact);
        }
    }
    unique.sort_by_key(|c| c.id.distance(key));
    unique.truncate(k);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LoopbackProtocol;

    fn contact(id: u64) -> Contact {
        Contact::new(NodeId::from_u64(id), LoopbackProtocol::new())
    }

    #[test]
    fn classify_splits_on_the_queried_nodes_distance() {
        let our_id = NodeId::max();
        let key = NodeId::zero();
        let queried = contact(0b1000); // distance 8 to key
        let mut closer = Vec::new();
        let mut further = Vec::new();

        classify_returned(
            our_id,
            key,
            &queried,
            vec![contact(0b1001), contact(0b0100), queried.clone()],
            &mut closer,
            &mut further,
        );

        // 0b1001 xor 0b1000 = 1 < 8: closer; 0b0100 xor 0b1000 = 12 >= 8: further
        assert_eq!(closer.len(), 1);
        assert_eq!(closer[0].id, NodeId::from_u64(0b1001));
        assert_eq!(further.len(), 1);
        assert_eq!(further[0].id, NodeId::from_u64(0b0100));
    }

    #[test]
    fn classify_skips_duplicates_and_self() {
        let our_id = NodeId::from_u64(42);
        let key = NodeId::zero();
        let queried = contact(8);
        let mut closer = vec![contact(9)];
        let mut further = Vec::new();

        classify_returned(
            our_id,
            key,
            &queried,
            vec![contact(9), contact(42)],
            &mut closer,
            &mut further,
        );
        assert_eq!(closer.len(), 1);
        assert!(further.is_empty());
    }

    #[test]
    fn seed_sorts_alpha_by_our_distance_and_dumps_the_rest() {
        let our_id = NodeId::from_u64(0b100);
        let key = NodeId::zero();
        let all = vec![contact(0b001), contact(0b111), contact(0b010), contact(0b110)];
        let mut closer = Vec::new();
        let mut further = Vec::new();

        let wave = seed_candidates(our_id, key, 3, &all, &mut closer, &mut further);
        assert_eq!(wave.len(), 3);
        // distances to key 0: 1 and 2 beat ours (4); 7 does not
        assert_eq!(closer.len(), 2);
        assert_eq!(further.len(), 2);
    }

    #[test]
    fn k_closest_dedups_sorts_and_truncates() {
        let key = NodeId::zero();
        let picked = k_closest(
            vec![contact(5), contact(1), contact(5), contact(3), contact(2)],
            &key,
            3,
        );
        let ids: Vec<_> = picked.iter().map(|c| c.id).collect();
        assert_eq!(
            ids,
            vec![NodeId::from_u64(1), NodeId::from_u64(2), NodeId::from_u64(3)]
        );
    }
}
