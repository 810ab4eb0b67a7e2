use std::collections::BTreeMap;

use super::entity::{BackendId, BackendKey};

const OFFSET_SEED: u32 = 0x811c_9dc5;
const SKIP_SEED: u32 = 0x5bd1_e995;

/// Build a Maglev lookup table of `size` slots (a prime) over `backends`.
///
/// The result is deterministic for a given backend set, independent of
/// insertion order, and empty when there are no backends.
pub fn build_lookup_table(backends: &BTreeMap<BackendKey, BackendId>, size: u32) -> Vec<BackendId> {
    let m = size as usize;
    if backends.is_empty() || m < 2 {
        return Vec::new();
    }

    let perms: Vec<(usize, usize, BackendId)> = backends
        .iter()
        .map(|(key, id)| {
            let offset = fnv1a(key, OFFSET_SEED) as usize % m;
            let skip = fnv1a(key, SKIP_SEED) as usize % (m - 1) + 1;
            (offset, skip, *id)
        })
        .collect();

    let mut next = vec![0usize; perms.len()];
    let mut table: Vec<Option<BackendId>> = vec![None; m];
    let mut filled = 0;

    'fill: loop {
        for (i, &(offset, skip, id)) in perms.iter().enumerate() {
            let mut slot = (offset + next[i] * skip) % m;
            while table[slot].is_some() {
                next[i] += 1;
                slot = (offset + next[i] * skip) % m;
            }
            table[slot] = Some(id);
            next[i] += 1;
            filled += 1;
            if filled == m {
                break 'fill;
            }
        }
    }

    table.into_iter().flatten().collect()
}

fn fnv1a(key: &BackendKey, seed: u32) -> u32 {
    let mut hash = seed;
    let octets: Vec<u8> = match key.ip {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    for byte in octets.into_iter().chain(key.port.to_be_bytes()) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
