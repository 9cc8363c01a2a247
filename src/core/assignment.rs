//! Minimum-cost rectangular assignment (Hungarian method with potentials).

use crate::types::{PeakError, PeakResult};
use ndarray::Array2;

/// Minimum-cost assignment on a rectangular cost matrix.
///
/// Every row is assigned when `rows <= cols`, every column otherwise. Returns
/// `(row, col)` pairs sorted by row. All costs must be finite.
pub fn solve(cost: &Array2<f64>) -> PeakResult<Vec<(usize, usize)>> {
    let (n, m) = cost.dim();
    if n == 0 || m == 0 {
        return Ok(Vec::new());
    }
    if cost.iter().any(|c| !c.is_finite()) {
        return Err(PeakError::Processing(
            "assignment cost matrix contains non-finite entries".to_string(),
        ));
    }

    if n > m {
        let transposed = cost.t().to_owned();
        let mut pairs: Vec<(usize, usize)> = solve_wide(&transposed)
            .into_iter()
            .map(|(c, r)| (r, c))
            .collect();
        pairs.sort_unstable();
        return Ok(pairs);
    }
    Ok(solve_wide(cost))
}

/// Shortest augmenting path with row/column potentials; requires rows <= cols.
fn solve_wide(cost: &Array2<f64>) -> Vec<(usize, usize)> {
    let (n, m) = cost.dim();
    // 1-based bookkeeping, index 0 is the virtual column
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        owner[0] = i;
        let mut j0 = 0usize;
        let mut min_v = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if reduced < min_v[j] {
                    min_v[j] = reduced;
                    way[j] = j0;
                }
                if min_v[j] < delta {
                    delta = min_v[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_v[j] -= delta;
                }
            }
            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        // augment along the stored path
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| owner[j] != 0)
        .map(|j| (owner[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable();
    pairs
}
