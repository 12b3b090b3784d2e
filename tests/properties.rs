use particle_sieve::forest::Forest;
use particle_sieve::geometry::cartesian::box_contains;
use particle_sieve::mesh::chunk_range;
use particle_sieve::prelude::*;
use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

mod util;
use util::{assert_permutation, ids, run_ranks};

fn seed_of(parts: &[u64]) -> u64 {
    let mut h = DefaultHasher::new();
    parts.hash(&mut h);
    h.finish()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_sort_places_each_particle_once(
        points in prop::collection::vec(prop::array::uniform2(0.0f64..1.0), 1..24),
        levels in 1u8..4,
        on_rank_one in any::<bool>(),
    ) {
        let points = &points;
        let held = run_ranks(2, |c| {
            let mesh = PartitionedMesh::<2>::hyper_cube(Aabb::unit(), levels, c).unwrap();
            let mut h = ParticleHandler::<2>::default();
            if (c.rank() == 1) == on_rank_one {
                let batch = points
                    .iter()
                    .enumerate()
                    .map(|(i, &x)| Particle::new(i as u64, x));
                h.insert_particles(batch, None).unwrap();
            }
            h.sort(&mesh, c).unwrap();
            h.validate_geometry(&mesh).unwrap();
            let first = ids(&h);
            let again = h.sort(&mesh, c).unwrap();
            (first, ids(&h), again)
        });

        let all: Vec<u64> = held.iter().flat_map(|(first, _, _)| first.iter().copied()).collect();
        let want: Vec<u64> = (0..points.len() as u64).collect();
        assert_permutation(&all, &want);
        for (first, second, again) in &held {
            prop_assert_eq!(first, second);
            prop_assert_eq!(again.sent + again.relocated + again.adopted, 0);
        }
    }

    #[test]
    fn prop_candidate_ranks_include_owner(
        n_ranks in 1usize..6,
        levels in 1u8..4,
        corner in any::<bool>(),
    ) {
        let mut rng = SmallRng::seed_from_u64(seed_of(&[n_ranks as u64, u64::from(levels), u64::from(corner)]));
        let domain = Aabb::new([-1.0, 0.0], [1.0, 0.5]);
        let mut forest = Forest::<2>::uniform(levels);
        if corner {
            forest.refine_by_indicator(|c| if c.coords == [0, 0] { 1.0 } else { 0.0 }, 0.5);
        }
        let leaves = forest.morton_sorted_leaves();
        let chunks: Vec<Vec<Aabb<2>>> = (0..n_ranks)
            .map(|r| leaves[chunk_range(leaves.len(), n_ranks, r)].iter().map(|t| t.bounds(&domain)).collect())
            .collect();
        let index = SubdomainIndex::from_boxes(
            chunks.iter().map(|cells| cells.iter().copied().reduce(|a, b| a.union(&b))).collect(),
        );

        for _ in 0..64 {
            let p = [rng.gen_range(-1.0..=1.0), rng.gen_range(0.0..=0.5)];
            let owners: Vec<usize> = (0..n_ranks)
                .filter(|&r| chunks[r].iter().any(|b| box_contains(b, &domain, &p)))
                .collect();
            prop_assert_eq!(owners.len(), 1, "point {:?} owned by {:?}", p, owners);
            let candidates = index.candidate_ranks(&p);
            prop_assert!(candidates.contains(&owners[0]), "point {:?}: {:?}", p, candidates);
            prop_assert!(candidates.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
