//! Backend selection: weighted random by default, consistent hashing when
//! the request carries a tenant or correlation identifier.

use agentmesh_operator::render::CompiledBackend;
use rand::Rng;

/// How a backend is picked from a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    WeightedRandom,
    ConsistentHash,
}

/// Pick a backend with the given strategy. Single-backend rules bypass
/// both strategies.
pub fn select<'a>(
    backends: &'a [CompiledBackend],
    strategy: SelectionStrategy,
    hash_key: &str,
) -> Option<&'a CompiledBackend> {
    match strategy {
        SelectionStrategy::ConsistentHash => select_consistent_hash(backends, hash_key),
        SelectionStrategy::WeightedRandom => select_weighted(backends),
    }
}

/// Weighted random: uniform integer in [0, total), linear scan
/// accumulating until the threshold. Zero total weight degrades to a
/// uniform pick.
pub fn select_weighted(backends: &[CompiledBackend]) -> Option<&CompiledBackend> {
    match backends {
        [] => return None,
        [only] => return Some(only),
        _ => {}
    }

    let total: i64 = backends.iter().map(|b| i64::from(b.weight.max(0))).sum();
    if total <= 0 {
        let idx = rand::thread_rng().gen_range(0..backends.len());
        return Some(&backends[idx]);
    }

    let threshold = rand::thread_rng().gen_range(0..total);
    let mut cumulative = 0i64;
    for backend in backends {
        cumulative += i64::from(backend.weight.max(0));
        if threshold < cumulative {
            return Some(backend);
        }
    }

    backends.last()
}

/// Consistent hash: FNV-1a over the key, mod the backend count. The same
/// key lands on the same backend while the backend set is stable.
pub fn select_consistent_hash<'a>(
    backends: &'a [CompiledBackend],
    key: &str,
) -> Option<&'a CompiledBackend> {
    match backends {
        [] => return None,
        [only] => return Some(only),
        _ => {}
    }

    let idx = (fnv1a_32(key.as_bytes()) as usize) % backends.len();
    Some(&backends[idx])
}

/// 32-bit FNV-1a.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
