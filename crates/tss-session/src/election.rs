//! Deterministic proposer election and signer-set selection.
//!
//! ```text
//! candidate(k) = parties_sorted[(H(session_id) + k) mod N]
//! ```
//!
//! `H` is the keyed BLAKE3 election hash read as an unsigned big-endian
//! integer. The proposer is the first candidate, for `k = 0, 1, …`, that the
//! local party considers ready. Both functions are pure in their inputs, so
//! peers with the same view agree.

use tss_crypto::hashing::{be_mod, election_hash};
use tss_types::CoreAddress;

/// The `k`-th election candidate. `parties` must be sorted.
pub fn candidate<'a>(
    session_id: &str,
    parties: &'a [CoreAddress],
    k: u64,
) -> Option<&'a CoreAddress> {
    let n = parties.len() as u64;
    if n == 0 {
        return None;
    }
    let base = be_mod(&election_hash(session_id), n);
    let index = (base + k % n) % n;
    parties.get(usize::try_from(index).ok()?)
}

/// First ready candidate and its fallback step.
pub fn elect<F>(session_id: &str, parties: &[CoreAddress], is_ready: F) -> Option<(CoreAddress, u64)>
where
    F: Fn(&CoreAddress) -> bool,
{
    (0..parties.len() as u64).find_map(|k| {
        candidate(session_id, parties, k)
            .filter(|p| is_ready(p))
            .map(|p| (p.clone(), k))
    })
}

/// The proposer plus the `threshold` lowest-sorted other ready parties.
///
/// Returns `None` when fewer than `threshold + 1` parties are ready. The
/// result is sorted.
pub fn signer_set<F>(
    parties: &[CoreAddress],
    proposer: &CoreAddress,
    threshold: usize,
    is_ready: F,
) -> Option<Vec<CoreAddress>>
where
    F: Fn(&CoreAddress) -> bool,
{
    let mut set: Vec<CoreAddress> = parties
        .iter()
        .filter(|p| *p != proposer && is_ready(p))
        .take(threshold)
        .cloned()
        .collect();
    if set.len() < threshold {
        return None;
    }
    set.push(proposer.clone());
    set.sort();
    Some(set)
}
