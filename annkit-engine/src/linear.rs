//! Exhaustive scan over every live point.

use crate::result_set::KnnResultSet;
use crate::store::{squared_l2, PointStore};

pub(crate) fn search(store: &PointStore, query: &[f32], result: &mut KnnResultSet) {
    for id in 0..store.len() {
        if store.is_removed(id) {
            continue;
        }
        result.add_point(squared_l2(query, store.row(id)), id);
    }
}
