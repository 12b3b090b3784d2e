//! Two-stage "sizes then data" all-to-all exchange.
//!
//! 1. Every rank posts a receive for a [`WireCount`] from every peer, then
//!    sends its own byte count to every peer (zero counts included, so no
//!    rank ever waits on a message that will not come).
//! 2. Non-empty payloads are exchanged on `tag.offset(1)`.
//!
//! All send and receive handles are drained before returning, even when an
//! error was observed, so a failing round never leaves stray messages in
//! flight for the next round to pick up.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut};
use crate::particle_error::ParticleError;

/// Exchange one buffer with every rank. `outgoing.len()` must equal
/// `comm.size()`; the entry for `comm.rank()` is moved to the result as is.
pub fn sizes_then_data<C>(
    comm: &C,
    tag: CommTag,
    mut outgoing: Vec<Vec<u8>>,
) -> Result<Vec<Vec<u8>>, ParticleError>
where
    C: Communicator + ?Sized,
{
    let me = comm.rank();
    let size = comm.size();
    if outgoing.len() != size {
        return Err(ParticleError::CollectiveDesync {
            peer: me,
            reason: format!(
                "exchange needs one buffer per rank: {} buffers for {size} ranks",
                outgoing.len()
            ),
        });
    }
    let mut incoming: Vec<Vec<u8>> = vec![Vec::new(); size];
    incoming[me] = std::mem::take(&mut outgoing[me]);
    let peers: Vec<usize> = (0..size).filter(|&p| p != me).collect();
    if peers.is_empty() {
        return Ok(incoming);
    }

    let recv_counts = exchange_counts(comm, tag, &peers, &outgoing)?;

    // stage 2: payloads
    let data_tag = tag.offset(1).as_u16();
    let mut recv_data = Vec::with_capacity(peers.len());
    for &peer in &peers {
        let n = recv_counts[peer];
        if n > 0 {
            let mut buf = vec![0u8; n];
            let h = comm.irecv(peer, data_tag, &mut buf);
            recv_data.push((peer, n, h));
        }
    }
    let mut pending_sends = Vec::with_capacity(peers.len());
    for &peer in &peers {
        if !outgoing[peer].is_empty() {
            pending_sends.push(comm.isend(peer, data_tag, &outgoing[peer]));
        }
    }

    let mut maybe_err = None;
    for (peer, n, h) in recv_data {
        match h.wait() {
            Some(data) if data.len() == n => incoming[peer] = data,
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(ParticleError::CollectiveDesync {
                    peer,
                    reason: format!("expected {n} payload bytes, got {}", data.len()),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(ParticleError::CollectiveDesync {
                    peer,
                    reason: "payload never arrived".into(),
                });
            }
            _ => {} // already have an error; just drain
        }
    }
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

/// Stage 1: returns the byte count each peer will send (indexed by rank).
fn exchange_counts<C>(
    comm: &C,
    tag: CommTag,
    peers: &[usize],
    outgoing: &[Vec<u8>],
) -> Result<Vec<usize>, ParticleError>
where
    C: Communicator + ?Sized,
{
    let mut recv_size = Vec::with_capacity(peers.len());
    for &peer in peers {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(
            peer,
            tag.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut cnt)),
        );
        recv_size.push((peer, h));
    }

    let mut pending_sends = Vec::with_capacity(peers.len());
    let mut maybe_err = None;
    for &peer in peers {
        let count = match u32::try_from(outgoing[peer].len()) {
            Ok(n) => WireCount::new(n as usize),
            Err(_) => {
                maybe_err.get_or_insert(ParticleError::ArchiveFormat(format!(
                    "message of {} bytes to rank {peer} exceeds the wire limit",
                    outgoing[peer].len()
                )));
                WireCount::new(0)
            }
        };
        pending_sends.push(comm.isend(
            peer,
            tag.as_u16(),
            cast_slice(std::slice::from_ref(&count)),
        ));
    }

    let mut counts = vec![0usize; comm.size()];
    for (peer, h) in recv_size {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                let mut cnt = WireCount::new(0);
                cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                counts[peer] = cnt.get();
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(ParticleError::CollectiveDesync {
                    peer,
                    reason: format!(
                        "expected {} bytes for size header, got {}",
                        std::mem::size_of::<WireCount>(),
                        data.len()
                    ),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(ParticleError::CollectiveDesync {
                    peer,
                    reason: format!("failed to receive size from rank {peer}"),
                });
            }
            _ => {}
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(counts),
    }
}

const FATAL: u64 = 1 << 32;

/// Collective: turn a per-rank outcome into a global one. A rank that failed
/// returns its own error; every other rank gets
/// [`ParticleError::RemoteFailure`] when any peer failed. A fatal failure
/// anywhere makes the outcome fatal on every rank.
pub fn agree<C, T>(comm: &C, local: Result<T, ParticleError>) -> Result<T, ParticleError>
where
    C: Communicator + ?Sized,
{
    let flag = match &local {
        Ok(_) => 0,
        Err(e) if e.is_fatal() => 1 | FATAL,
        Err(_) => 1,
    };
    let total = comm.allreduce_sum(flag)?;
    let count = total & (FATAL - 1);
    let fatal = total >> 32 > 0;
    match local {
        Err(err) if err.is_fatal() || !fatal => Err(err),
        Err(err) => {
            log::warn!("[agree] rank {} failed with {err} while a peer failed fatally", comm.rank());
            Err(ParticleError::RemoteFailure { count, fatal })
        }
        Ok(_) if count > 0 => Err(ParticleError::RemoteFailure { count, fatal }),
        ok => ok,
    }
}
