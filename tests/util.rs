#![allow(dead_code)]
use particle_sieve::prelude::*;

/// Run `f` once per rank of a fresh in-process world of `n` ranks, each on
/// its own thread; results are indexed by rank.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&RayonComm) -> T + Sync,
{
    let world = RayonComm::world(n);
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = world.iter().map(|c| s.spawn(move || f(c))).collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Copy + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort_unstable();
    let mut b = want.to_vec();
    b.sort_unstable();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}

/// Properties of particle `id`: its identifier as 8 little-endian bytes.
pub fn payload(id: u64) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

/// The two-particle population used throughout: particle 0 in the lower
/// corner, particle 1 just past the middle of the domain.
pub fn corner_pair<const D: usize>(with_payload: bool) -> Vec<Particle<D>> {
    flat_corner_pair::<D, D>(with_payload)
}

/// [`corner_pair`] for an `M`-dimensional mesh in `D`-dimensional space:
/// coordinates past `M` are zero.
pub fn flat_corner_pair<const M: usize, const D: usize>(with_payload: bool) -> Vec<Particle<D>> {
    [(0u64, 0.125), (1u64, 0.525)]
        .into_iter()
        .map(|(id, x)| {
            let p = Particle::new(id, std::array::from_fn(|k| if k < M { x } else { 0.0 }));
            if with_payload {
                p.with_properties(payload(id))
            } else {
                p
            }
        })
        .collect()
}

/// Identifiers held by a handler, ascending.
pub fn ids<const D: usize>(h: &ParticleHandler<D>) -> Vec<u64> {
    let mut ids: Vec<u64> = h.iter().map(|p| p.id.get()).collect();
    ids.sort_unstable();
    ids
}
