use particle_sieve::prelude::*;

mod util;
use util::{assert_permutation, corner_pair, flat_corner_pair, ids, payload, run_ranks};

const TAG: &str = "restart";

type Held = Vec<(u64, Vec<u8>, Vec<f64>)>;

/// Sort and checkpoint the corner pair on two ranks of an `M`-dimensional
/// mesh in `D`-dimensional space, then restart on `restart_ranks` ranks;
/// returns what each restarted rank holds.
fn checkpoint_cycle<const M: usize, const D: usize>(restart_ranks: usize, policy: RestorePolicy) -> Vec<Held> {
    let store = MemoryStore::new();
    let config = ParticleHandlerConfig::default()
        .with_payload_size(8)
        .with_restore_policy(policy);

    let archives = run_ranks(2, |c| {
        let mut mesh = PartitionedMesh::<M, D>::hyper_cube(Aabb::unit(), 2, c).unwrap();
        let mut h = ParticleHandler::<D>::new(config.clone());
        if c.rank() == 0 {
            let hint = mesh.local_cells().next();
            h.insert_particles(flat_corner_pair::<M, D>(true), hint).unwrap();
        }
        h.sort(&mesh, c).unwrap();
        assert_eq!(ids(&h), vec![c.rank() as u64]);

        h.prepare_for_serialization(&mut mesh).unwrap();
        let archive = h.serialize(&mut mesh, c).unwrap();
        assert_eq!(h.state(), HandlerState::Serialized);
        mesh.save(&store, TAG, c).unwrap();
        assert_eq!(mesh.phase(), &CheckpointPhase::Saved(TAG.into()));

        h.clear();
        mesh.clear();
        archive
    });
    assert_eq!(archives[0], archives[1]);
    let archive = &archives[0];

    let held = run_ranks(restart_ranks, |c| {
        let mut mesh = PartitionedMesh::<M, D>::empty(Aabb::unit(), c);
        let mut h = ParticleHandler::<D>::new(config.clone());
        h.deserialize(archive, &mesh).unwrap();
        assert_eq!(h.state(), HandlerState::Restoring);
        mesh.load(&store, TAG, c).unwrap();
        h.restore_from_mesh(&mesh, c).unwrap();

        assert_eq!(h.state() == HandlerState::Sorted, h.n_locally_owned_particles() > 0);
        h.validate_geometry(&mesh).unwrap();
        assert_eq!(h.n_global_particles(c).unwrap(), 2);
        assert_eq!(h.next_free_particle_id(c).unwrap(), 2);
        h.iter()
            .map(|p| (p.id.get(), p.properties.to_vec(), p.position.to_vec()))
            .collect::<Held>()
    });

    let all: Vec<_> = held.iter().flatten().collect();
    assert_permutation(&all.iter().map(|(id, _, _)| *id).collect::<Vec<_>>(), &[0, 1]);
    for (id, props, position) in all {
        assert_eq!(props, &payload(*id));
        let x = if *id == 0 { 0.125 } else { 0.525 };
        let want: Vec<f64> = (0..D).map(|k| if k < M { x } else { 0.0 }).collect();
        assert_eq!(position, &want);
    }
    held
}

#[test]
fn restart_on_same_ranks_1d() {
    let held = checkpoint_cycle::<1, 1>(2, RestorePolicy::AlwaysSort);
    assert_eq!(held[0][0].0, 0);
    assert_eq!(held[1][0].0, 1);
}

#[test]
fn restart_on_same_ranks_2d() {
    let held = checkpoint_cycle::<2, 2>(2, RestorePolicy::AlwaysSort);
    assert_eq!(held[0][0].0, 0);
    assert_eq!(held[1][0].0, 1);
}

#[test]
fn restart_on_same_ranks_3d() {
    let held = checkpoint_cycle::<3, 3>(2, RestorePolicy::AlwaysSort);
    assert_eq!(held[0][0].0, 0);
    assert_eq!(held[1][0].0, 1);
}

#[test]
fn restart_flat_mesh_in_3d() {
    let held = checkpoint_cycle::<2, 3>(2, RestorePolicy::AlwaysSort);
    assert_eq!(held[0][0].0, 0);
    assert_eq!(held[1][0].0, 1);
    let held = checkpoint_cycle::<2, 3>(3, RestorePolicy::TrustAttachments);
    assert_eq!(held[0][0].0, 0);
    let held = checkpoint_cycle::<1, 2>(1, RestorePolicy::AlwaysSort);
    assert_eq!(held[0].len(), 2);
}

#[test]
fn restart_trusting_attachments() {
    checkpoint_cycle::<2, 2>(2, RestorePolicy::TrustAttachments);
    checkpoint_cycle::<3, 3>(2, RestorePolicy::TrustAttachments);
}

#[test]
fn restart_on_one_rank() {
    let held = checkpoint_cycle::<2, 2>(1, RestorePolicy::AlwaysSort);
    assert_eq!(held[0].len(), 2);
    let held = checkpoint_cycle::<1, 1>(1, RestorePolicy::TrustAttachments);
    assert_eq!(held[0].len(), 2);
}

#[test]
fn restart_on_three_ranks() {
    for held in [
        checkpoint_cycle::<1, 1>(3, RestorePolicy::AlwaysSort),
        checkpoint_cycle::<2, 2>(3, RestorePolicy::TrustAttachments),
        checkpoint_cycle::<3, 3>(3, RestorePolicy::AlwaysSort),
    ] {
        // Particle 0 sits in the first Morton cell.
        assert_eq!(held[0].len(), 1);
        assert_eq!(held[0][0].0, 0);
    }
}

fn sorted_serial_pair() -> (PartitionedMesh<2>, ParticleHandler<2>) {
    let mesh = PartitionedMesh::<2>::hyper_cube(Aabb::unit(), 2, &NoComm).unwrap();
    let mut h = ParticleHandler::<2>::default();
    h.insert_particles(corner_pair::<2>(false), None).unwrap();
    h.sort(&mesh, &NoComm).unwrap();
    (mesh, h)
}

fn is_order_violation(err: &ParticleError, op: &str) -> bool {
    matches!(err, ParticleError::CheckpointOrderViolation { operation, .. } if *operation == op)
}

#[test]
fn serialize_without_prepare_is_rejected() {
    let (mut mesh, mut h) = sorted_serial_pair();
    let err = h.serialize(&mut mesh, &NoComm).unwrap_err();
    assert!(is_order_violation(&err, "serialize"), "{err}");
    assert_eq!(h.state(), HandlerState::Sorted);
}

#[test]
fn save_before_serialize_is_rejected() {
    let store = MemoryStore::new();
    let (mut mesh, mut h) = sorted_serial_pair();
    h.prepare_for_serialization(&mut mesh).unwrap();
    let err = mesh.save(&store, TAG, &NoComm).unwrap_err();
    assert!(is_order_violation(&err, "save"), "{err}");
    assert!(store.names().is_empty());
}

#[test]
fn deserialize_after_load_is_rejected() {
    let store = MemoryStore::new();
    let (mut mesh, mut h) = sorted_serial_pair();
    h.prepare_for_serialization(&mut mesh).unwrap();
    let archive = h.serialize(&mut mesh, &NoComm).unwrap();
    mesh.save(&store, TAG, &NoComm).unwrap();
    mesh.clear();
    mesh.load(&store, TAG, &NoComm).unwrap();

    let mut fresh = ParticleHandler::<2>::default();
    let err = fresh.deserialize(&archive, &mesh).unwrap_err();
    assert!(is_order_violation(&err, "deserialize"), "{err}");
    assert_eq!(fresh.state(), HandlerState::Empty);
}

#[test]
fn restore_before_load_is_rejected() {
    let store = MemoryStore::new();
    let (mut mesh, mut h) = sorted_serial_pair();
    h.prepare_for_serialization(&mut mesh).unwrap();
    let archive = h.serialize(&mut mesh, &NoComm).unwrap();
    mesh.save(&store, TAG, &NoComm).unwrap();
    mesh.clear();

    let mut fresh = ParticleHandler::<2>::default();
    fresh.deserialize(&archive, &mesh).unwrap();
    let err = fresh.restore_from_mesh(&mesh, &NoComm).unwrap_err();
    assert!(is_order_violation(&err, "restore_from_mesh"), "{err}");

    // The archive is still pending; finishing the cycle works.
    mesh.load(&store, TAG, &NoComm).unwrap();
    fresh.restore_from_mesh(&mesh, &NoComm).unwrap();
    assert_eq!(ids(&fresh), vec![0, 1]);
}

#[test]
fn archive_from_other_payload_size_is_rejected() {
    let (mut mesh, mut h) = sorted_serial_pair();
    h.prepare_for_serialization(&mut mesh).unwrap();
    let archive = h.serialize(&mut mesh, &NoComm).unwrap();
    mesh.clear();

    let mut other = ParticleHandler::<2>::new(ParticleHandlerConfig::default().with_payload_size(4));
    let err = other.deserialize(&archive, &mesh).unwrap_err();
    assert!(matches!(err, ParticleError::ArchiveFormat(_)), "{err}");
    assert_eq!(other.state(), HandlerState::Empty);
}

#[test]
fn run_continues_after_checkpoint() {
    let store = MemoryStore::new();
    let config = ParticleHandlerConfig::default().with_payload_size(8);
    let archives = run_ranks(2, |c| {
        let mut mesh = PartitionedMesh::<2>::hyper_cube(Aabb::unit(), 2, c).unwrap();
        let mut h = ParticleHandler::<2>::new(config.clone());
        if c.rank() == 0 {
            h.insert_particles(corner_pair::<2>(true), None).unwrap();
        }
        h.sort(&mesh, c).unwrap();
        h.prepare_for_serialization(&mut mesh).unwrap();
        h.serialize(&mut mesh, c).unwrap();
        let err = h.sort(&mesh, c).unwrap_err();
        assert!(is_order_violation(&err, "sort"), "{err}");
        mesh.save(&store, "step-1", c).unwrap();

        // Particle 0 drifts into the upper half, which rank 1 owns.
        if c.rank() == 0 {
            h.set_position(ParticleId::new(0), [0.125, 0.875]).unwrap();
        }
        let report = h.sort(&mesh, c).unwrap();
        if c.rank() == 0 {
            assert_eq!(report.sent, 1);
            assert!(ids(&h).is_empty());
        } else {
            assert_eq!(report.adopted, 1);
            assert_eq!(ids(&h), vec![0, 1]);
        }
        h.prepare_for_serialization(&mut mesh).unwrap();
        let archive = h.serialize(&mut mesh, c).unwrap();
        mesh.save(&store, "step-2", c).unwrap();
        archive
    });

    let mut mesh = PartitionedMesh::<2>::empty(Aabb::unit(), &NoComm);
    let mut h = ParticleHandler::<2>::new(config);
    h.deserialize(&archives[0], &mesh).unwrap();
    mesh.load(&store, "step-2", &NoComm).unwrap();
    h.restore_from_mesh(&mesh, &NoComm).unwrap();
    assert_eq!(ids(&h), vec![0, 1]);
    assert_eq!(h.get(ParticleId::new(0)).unwrap().position(), &[0.125, 0.875]);
}

#[test]
fn checkpoint_without_particle_data_names_the_leaf() {
    let store = MemoryStore::new();
    let (mut mesh, mut h) = sorted_serial_pair();
    h.prepare_for_serialization(&mut mesh).unwrap();
    let archive = h.serialize(&mut mesh, &NoComm).unwrap();
    let mut bare = PartitionedMesh::<2>::hyper_cube(Aabb::unit(), 2, &NoComm).unwrap();
    bare.save(&store, "bare", &NoComm).unwrap();

    let mut reloaded = PartitionedMesh::<2>::empty(Aabb::unit(), &NoComm);
    let mut fresh = ParticleHandler::<2>::default();
    fresh.deserialize(&archive, &reloaded).unwrap();
    reloaded.load(&store, "bare", &NoComm).unwrap();
    let err = fresh.restore_from_mesh(&reloaded, &NoComm).unwrap_err();
    assert!(matches!(err, ParticleError::MeshCheckpoint(_)), "{err}");
    assert!(err.to_string().contains("leaf"), "{err}");
    assert_eq!(fresh.state(), HandlerState::Empty);
}
