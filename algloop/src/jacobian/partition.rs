use faer::sparse::SymbolicSparseColMat;

/// Columns grouped so that no two columns in a group share a structurally
/// nonzero row. All columns of one group can be perturbed at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnPartition {
    groups: Vec<Vec<usize>>,
    /// Structurally nonzero rows of each column.
    rows: Vec<Vec<usize>>,
}

impl ColumnPartition {
    /// Greedy first-fit partition in column order.
    pub(crate) fn new(pattern: &SymbolicSparseColMat<usize>) -> Self {
        let pattern = pattern.as_ref();
        let nrows = pattern.nrows();
        let ncols = pattern.ncols();
        let col_ptr = pattern.col_ptr();
        let col_nnz = pattern.col_nnz();
        let row_idx = pattern.row_idx();
        let rows: Vec<Vec<usize>> = (0..ncols)
            .map(|j| {
                let start = col_ptr[j];
                let end = match col_nnz {
                    Some(nnz) => start + nnz[j],
                    None => col_ptr[j + 1],
                };
                row_idx[start..end].to_vec()
            })
            .collect();

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut occupied: Vec<Vec<bool>> = Vec::new();
        for (j, col_rows) in rows.iter().enumerate() {
            let slot = occupied
                .iter()
                .position(|taken| col_rows.iter().all(|&i| !taken[i]));
            let k = match slot {
                Some(k) => k,
                None => {
                    groups.push(Vec::new());
                    occupied.push(vec![false; nrows]);
                    groups.len() - 1
                }
            };
            groups[k].push(j);
            for &i in col_rows {
                occupied[k][i] = true;
            }
        }
        Self { groups, rows }
    }

    /// The column groups.
    pub(crate) fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    /// Structurally nonzero rows of column `j`.
    pub(crate) fn rows_of(&self, j: usize) -> &[usize] {
        &self.rows[j]
    }

    pub(crate) fn ncols(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use faer::sparse::Pair;

    use super::*;

    fn pattern(n: usize, cells: &[(usize, usize)]) -> SymbolicSparseColMat<usize> {
        let pairs: Vec<Pair<usize, usize>> =
            cells.iter().map(|&(row, col)| Pair { row, col }).collect();
        SymbolicSparseColMat::try_new_from_indices(n, n, &pairs)
            .unwrap()
            .0
    }

    #[test]
    fn diagonal_fits_in_one_group() {
        let p = pattern(4, &[(0, 0), (1, 1), (2, 2), (3, 3)]);
        let partition = ColumnPartition::new(&p);
        assert_eq!(partition.groups(), &[vec![0, 1, 2, 3]]);
    }

    #[test]
    fn tridiagonal_needs_three_groups() {
        let n = 6;
        let mut cells = Vec::new();
        for i in 0..n {
            cells.push((i, i));
            if i > 0 {
                cells.push((i, i - 1));
            }
            if i + 1 < n {
                cells.push((i, i + 1));
            }
        }
        let partition = ColumnPartition::new(&pattern(n, &cells));
        assert_eq!(partition.groups().len(), 3);
        assert_eq!(partition.groups()[0], vec![0, 3]);
        assert_eq!(partition.rows_of(0), &[0, 1]);
    }

    #[test]
    fn dense_column_gets_its_own_group() {
        let p = pattern(3, &[(0, 0), (1, 0), (2, 0), (1, 1), (2, 2)]);
        let partition = ColumnPartition::new(&p);
        assert_eq!(partition.groups(), &[vec![0], vec![1, 2]]);
        assert_eq!(partition.ncols(), 3);
    }
}
