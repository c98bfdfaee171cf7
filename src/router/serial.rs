//! One-RPC-at-a-time iterative lookup

use super::{
    classify_returned, issue_rpc, k_closest, seed_candidates, LookupKind, LookupResult, Router,
};
use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::node::Node;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Serial lookup driver: queries one contact at a time, alpha per wave
pub struct SerialRouter {
    config: DhtConfig,
}

impl SerialRouter {
    pub fn new(config: DhtConfig) -> Self {
        Self { config }
    }

    /// Query one wave; a value hit short-circuits with the full encountered
    /// set so the caller can pick intermediate closer peers to cache at.
    async fn query_wave(
        &self,
        node: &Arc<Node>,
        key: NodeId,
        kind: LookupKind,
        wave: &[Contact],
        closer: &mut Vec<Contact>,
        further: &mut Vec<Contact>,
    ) -> Option<LookupResult> {
        for target in wave {
            match issue_rpc(node, kind, key, target).await {
                Err(e) => {
                    debug!(peer = %target.id, "lookup rpc failed: {e}");
                    node.report_error(&e, target).await;
                }
                Ok((returned, value)) => {
                    classify_returned(node.our_id(), key, target, returned, closer, further);
                    if let Some(value) = value {
                        let mut encountered = closer.clone();
                        encountered.extend(further.iter().cloned());
                        return Some(LookupResult {
                            found: true,
                            contacts: k_closest(encountered, &key, self.config.k),
                            found_by: Some(target.clone()),
                            value: Some(value),
                        });
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl Router for SerialRouter {
    async fn lookup(
        &self,
        node: &Arc<Node>,
        key: NodeId,
        kind: LookupKind,
    ) -> Result<LookupResult> {
        let initial = node.bucket_list().close_contacts(&key, None).await;
        if initial.is_empty() {
            return Err(Error::AllBucketsEmpty);
        }

        let mut closer = Vec::new();
        let mut further = Vec::new();
        let mut contacted: HashSet<NodeId> = HashSet::new();

        let wave = seed_candidates(
            node.our_id(),
            key,
            self.config.alpha,
            &initial,
            &mut closer,
            &mut further,
        );
        contacted.extend(wave.iter().map(|c| c.id));

        if let Some(found) = self
            .query_wave(node, key, kind, &wave, &mut closer, &mut further)
            .await
        {
            return Ok(found);
        }

        let mut ret: Vec<Contact> = closer.clone();

        while ret.len() < self.config.k {
            let closer_uncontacted: Vec<Contact> = closer
                .iter()
                .filter(|c| !contacted.contains(&c.id))
                .cloned()
                .collect();
            let further_uncontacted: Vec<Contact> = further
                .iter()
                .filter(|c| !contacted.contains(&c.id))
                .cloned()
                .collect();

            let wave: Vec<Contact> = if !closer_uncontacted.is_empty() {
                closer_uncontacted.into_iter().take(self.config.alpha).collect()
            } else if !further_uncontacted.is_empty() {
                further_uncontacted.into_iter().take(self.config.alpha).collect()
            } else {
                break;
            };

            contacted.extend(wave.iter().map(|c| c.id));
            if let Some(found) = self
                .query_wave(node, key, kind, &wave, &mut closer, &mut further)
                .await
            {
                return Ok(found);
            }

            for contact in &closer {
                if !ret.iter().any(|c| c.id == contact.id) {
                    ret.push(contact.clone());
                }
            }
        }

        ret.extend(initial);
        Ok(LookupResult {
            found: false,
            contacts: k_closest(ret, &key, self.config.k),
            found_by: None,
            value: None,
        })
    }
}
