//! The XOR-metric routing table: an ordered list of k-buckets partitioning
//! the 160-bit id space, with split/replace/refresh policy.

use crate::id::{NodeId, ID_LEN};
use crate::node::Node;
use rand::RngCore;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default bucket capacity (`k` in the Kademlia paper).
pub const DEFAULT_KSIZE: usize = 20;
/// Buckets idle longer than this are due for a refresh lookup.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Outcome of [`RoutingTable::add_contact`]. The caller drives any
/// liveness challenge the table can't perform itself (it has no RPC
/// client), then reports back via [`RoutingTable::resolve_challenge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// `n` was new and the bucket had room, or `n` was already present and
    /// has been moved to the tail (refreshed).
    Accepted,
    /// The bucket covering `n.id` is full and not splittable. The caller
    /// must PING `challenge.head` and call [`RoutingTable::resolve_challenge`]
    /// with the outcome.
    ChallengeRequired(PendingChallenge),
    /// A challenge is already outstanding for this bucket; `n` is dropped.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    pub bucket_index: usize,
    pub head: Node,
    pub candidate: Node,
}

/// Result reported back to [`RoutingTable::resolve_challenge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeResult {
    /// The head contact answered the PING: it stays, the candidate is
    /// discarded.
    HeadAlive,
    /// The head contact timed out: it is evicted, the candidate takes its
    /// place at the tail.
    HeadDead,
}

struct KBucket {
    lo: [u8; ID_LEN],
    hi: [u8; ID_LEN],
    contacts: Vec<Node>,
    last_updated: Instant,
    pending: Option<PendingChallenge>,
}

impl KBucket {
    fn covering_full_range() -> Self {
        Self {
            lo: [0u8; ID_LEN],
            hi: [0xffu8; ID_LEN],
            contacts: Vec::new(),
            last_updated: Instant::now(),
            pending: None,
        }
    }

    fn covers(&self, id: &NodeId) -> bool {
        let bytes = id.as_bytes();
        *bytes >= self.lo && *bytes <= self.hi
    }

    /// Only a bucket containing the local node's id may ever split.
    fn is_splittable(&self, local_id: &NodeId) -> bool {
        self.covers(local_id)
    }

    fn touch(&mut self) {
        self.last_updated = Instant::now();
    }
}

/// An ordered list of k-buckets plus the local node id.
///
/// Invariants: the buckets partition `[0, 2^160)` with no
/// overlap and total coverage; each bucket holds at most `ksize` contacts;
/// only the bucket containing `local_id` is ever split.
pub struct RoutingTable {
    local_id: NodeId,
    ksize: usize,
    refresh_interval: Duration,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, ksize: usize) -> Self {
        Self {
            local_id,
            ksize,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            buckets: vec![KBucket::covering_full_range()],
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_index_for(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.covers(id))
            .expect("buckets partition the full id space")
    }

    /// Adds or refreshes a contact. See [`AddOutcome`] for what the caller
    /// must do next.
    pub fn add_contact(&mut self, n: Node) -> AddOutcome {
        if n.id == self.local_id {
            return AddOutcome::Dropped;
        }

        let index = self.bucket_index_for(&n.id);

        if let Some(pos) = self.buckets[index].contacts.iter().position(|c| c.id == n.id) {
            let mut existing = self.buckets[index].contacts.remove(pos);
            existing.addr = n.addr;
            self.buckets[index].contacts.push(existing);
            self.buckets[index].touch();
            return AddOutcome::Accepted;
        }

        if self.buckets[index].contacts.len() < self.ksize {
            self.buckets[index].contacts.push(n);
            self.buckets[index].touch();
            return AddOutcome::Accepted;
        }

        if self.buckets[index].is_splittable(&self.local_id) {
            self.split_bucket(index);
            return self.add_contact(n);
        }

        if self.buckets[index].pending.is_some() {
            trace!(bucket = index, "challenge already pending, dropping contact");
            return AddOutcome::Dropped;
        }

        let head = self.buckets[index].contacts[0];
        let challenge = PendingChallenge {
            bucket_index: index,
            head,
            candidate: n,
        };
        self.buckets[index].pending = Some(challenge.clone());
        AddOutcome::ChallengeRequired(challenge)
    }

    /// Resolves a previously issued [`PendingChallenge`].
    pub fn resolve_challenge(&mut self, challenge: PendingChallenge, result: ChallengeResult) {
        let Some(bucket) = self.buckets.get_mut(challenge.bucket_index) else {
            return;
        };
        if bucket.pending.as_ref() != Some(&challenge) {
            // Stale: the bucket has since split or the challenge was
            // superseded. Nothing to do.
            return;
        }
        bucket.pending = None;
        match result {
            ChallengeResult::HeadAlive => {
                if let Some(pos) = bucket.contacts.iter().position(|c| c.id == challenge.head.id) {
                    let head = bucket.contacts.remove(pos);
                    bucket.contacts.push(head);
                }
                debug!(head = %challenge.head.id, "liveness challenge: head alive, candidate dropped");
            }
            ChallengeResult::HeadDead => {
                bucket.contacts.retain(|c| c.id != challenge.head.id);
                bucket.contacts.push(challenge.candidate);
                debug!(head = %challenge.head.id, "liveness challenge: head evicted");
            }
        }
        bucket.touch();
    }

    pub fn remove_contact(&mut self, id: &NodeId) {
        let index = self.bucket_index_for(id);
        self.buckets[index].contacts.retain(|c| &c.id != id);
    }

    /// Splits the bucket at `index` at its numeric midpoint, redistributing
    /// contacts and inheriting `last_updated`.
    fn split_bucket(&mut self, index: usize) {
        let old = &self.buckets[index];
        let mid = midpoint(&old.lo, &old.hi);
        let (lo, hi, last_updated) = (old.lo, old.hi, old.last_updated);

        let mut lower = KBucket {
            lo,
            hi: sub_one(&mid),
            contacts: Vec::new(),
            last_updated,
            pending: None,
        };
        let mut upper = KBucket {
            lo: mid,
            hi,
            contacts: Vec::new(),
            last_updated,
            pending: None,
        };

        for c in self.buckets[index].contacts.drain(..) {
            if lower.covers(&c.id) {
                lower.contacts.push(c);
            } else {
                upper.contacts.push(c);
            }
        }

        self.buckets.splice(index..=index, [lower, upper]);
    }

    /// Up to `count` contacts nearest `target`, drawn from all buckets,
    /// excluding ids present in `exclude`.
    pub fn find_neighbors(&self, target: &NodeId, count: usize, exclude: &[NodeId]) -> Vec<Node> {
        let mut all: Vec<Node> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter().copied())
            .filter(|c| !exclude.contains(&c.id))
            .collect();
        all.sort_by_key(|c| (c.distance_to(target), c.id));
        all.truncate(count);
        all
    }

    /// For each bucket idle longer than the refresh interval, a random id
    /// within that bucket's range.
    pub fn get_refresh_ids(&self) -> Vec<NodeId> {
        let now = Instant::now();
        self.buckets
            .iter()
            .filter(|b| now.duration_since(b.last_updated) > self.refresh_interval)
            .map(|b| random_id_in_range(&b.lo, &b.hi))
            .collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn contact_count(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    /// Union of bucket ranges is `[0, 2^160)` with no overlap (invariant
    /// exposed for tests.
    #[cfg(test)]
    fn ranges(&self) -> Vec<([u8; ID_LEN], [u8; ID_LEN])> {
        self.buckets.iter().map(|b| (b.lo, b.hi)).collect()
    }
}

fn sub_one(bytes: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = *bytes;
    for i in (0..ID_LEN).rev() {
        if out[i] == 0 {
            out[i] = 0xff;
        } else {
            out[i] -= 1;
            break;
        }
    }
    out
}

fn add_one(bytes: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = *bytes;
    for i in (0..ID_LEN).rev() {
        if out[i] == 0xff {
            out[i] = 0;
        } else {
            out[i] += 1;
            break;
        }
    }
    out
}

fn shr1(bytes: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut carry = 0u8;
    for i in 0..ID_LEN {
        out[i] = (bytes[i] >> 1) | (carry << 7);
        carry = bytes[i] & 1;
    }
    out
}

fn sub(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut borrow: i16 = 0;
    for i in (0..ID_LEN).rev() {
        let mut diff = a[i] as i16 - b[i] as i16 - borrow;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out[i] = diff as u8;
    }
    out
}

fn add(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut carry: u16 = 0;
    for i in (0..ID_LEN).rev() {
        let sum = a[i] as u16 + b[i] as u16 + carry;
        out[i] = sum as u8;
        carry = sum >> 8;
    }
    out
}

/// `lo + (hi - lo) / 2 + 1`, the split point of a range. Computed as
/// `lo + (hi-lo)/2 + 1` rather than `lo + (hi-lo+1)/2`: the latter adds one
/// to `hi - lo` *before* halving, which overflows 20 bytes for the initial
/// full-range bucket (`hi - lo + 1 == 2^160`) and silently wraps to zero,
/// collapsing the split into two buckets that both cover the whole space.
fn midpoint(lo: &[u8; ID_LEN], hi: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let half = shr1(&sub(hi, lo));
    add(lo, &add_one(&half))
}

/// A uniformly random id within `[lo, hi]`. Valid because every bucket
/// range produced by [`midpoint`] splitting has the form `prefix||0..0` to
/// `prefix||1..1`: the bits where `lo` and `hi` differ are exactly the
/// bucket's free bits.
fn random_id_in_range(lo: &[u8; ID_LEN], hi: &[u8; ID_LEN]) -> NodeId {
    let mut rng = rand::thread_rng();
    let mut random = [0u8; ID_LEN];
    rng.fill_bytes(&mut random);
    let mut out = [0u8; ID_LEN];
    for i in 0..ID_LEN {
        let mask = lo[i] ^ hi[i];
        out[i] = (lo[i] & !mask) | (random[i] & mask);
    }
    NodeId::from_bytes(out)
}
