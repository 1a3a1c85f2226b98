//! Batch ordering for the training loop

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Upper bound on how many batches one megabatch spans
const MAX_MEGABATCH_MULTIPLIER: usize = 50;

/// Shuffled example order for one epoch, seeded by `seed + epoch`
pub fn random_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)));
    order
}

/// Example order that keeps similar lengths in the same batch.
///
/// `lengths` are real token counts, not padded lengths. With every example
/// padded to the same length, grouping would degrade to `random_order`.
///
/// A random permutation is cut into megabatches of several batches each, and
/// every megabatch is sorted by length, longest first. The megabatch holding
/// the overall longest example is moved to the front so memory pressure peaks
/// on the first step.
pub fn length_grouped_order(lengths: &[usize], batch_size: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let n = lengths.len();
    if n == 0 {
        return Vec::new();
    }

    let batch_size = batch_size.max(1);
    let multiplier = (n / (batch_size * 4)).clamp(1, MAX_MEGABATCH_MULTIPLIER);
    let megabatch_size = multiplier * batch_size;

    let order = random_order(n, seed, epoch);
    let mut megabatches: Vec<Vec<usize>> = order
        .chunks(megabatch_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
            chunk
        })
        .collect();

    let longest = megabatches
        .iter()
        .enumerate()
        .max_by_key(|(i, mb)| (lengths[mb[0]], std::cmp::Reverse(*i)))
        .map(|(i, _)| i)
        .unwrap_or(0);
    if longest != 0 {
        let (first, rest) = megabatches.split_at_mut(1);
        std::mem::swap(&mut first[0][0], &mut rest[longest - 1][0]);
    }

    megabatches.into_iter().flatten().collect()
}
