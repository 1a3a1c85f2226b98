//! Seeded train/test split

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{DatasetError, DatasetResult};

/// Result of a train/test split
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit<T> {
    pub train: Vec<T>,
    pub test: Vec<T>,
}

/// Split `items` into train and test partitions.
///
/// The test partition holds `ceil(test_fraction * n)` items and the train
/// partition `floor(train_fraction * n)` items, both drawn from one seeded
/// permutation (test first, then train). Items left over when the fractions
/// sum to less than one are dropped.
pub fn train_test_split<T>(
    items: Vec<T>,
    train_fraction: f64,
    test_fraction: f64,
    seed: u64,
) -> DatasetResult<DatasetSplit<T>> {
    let total = items.len();
    let n_test = (test_fraction * total as f64).ceil() as usize;
    let n_train = (train_fraction * total as f64).floor() as usize;

    if n_train == 0 || n_test == 0 || n_train + n_test > total {
        return Err(DatasetError::Split { total, train: n_train, test: n_test });
    }

    let mut order: Vec<usize> = (0..total).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut take = |indices: &[usize]| -> Vec<T> {
        indices
            .iter()
            .filter_map(|&i| slots[i].take())
            .collect()
    };

    let test = take(&order[..n_test]);
    let train = take(&order[n_test..n_test + n_train]);

    Ok(DatasetSplit { train, test })
}
