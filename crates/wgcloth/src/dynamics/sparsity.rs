//! CSR sparsity pattern shared by all dynamics terms.
//!
//! Terms declare the off-diagonal `(i, j)` entries they will write before any
//! assembly happens; the builder then emits a compressed-sparse-row pattern
//! with an exact `(row, col) → nnz index` lookup so per-element block indices
//! can be precomputed once and scattered without atomics.

use std::collections::{BTreeSet, HashMap};
use wgcloth_core::{ClothError, ClothResult};

/// Builds and holds a symmetric CSR sparsity pattern over `node_count` nodes.
pub struct SparsityBuilder {
    adjacency: Vec<BTreeSet<u32>>,
    row_ptr: Vec<u32>,
    col_idx: Vec<u32>,
    lookup: HashMap<(u32, u32), u32>,
    built: bool,
}

impl SparsityBuilder {
    /// Creates a builder for a system with `node_count` nodes and no edges.
    pub fn new(node_count: usize) -> Self {
        Self {
            adjacency: vec![BTreeSet::new(); node_count],
            row_ptr: Vec::new(),
            col_idx: Vec::new(),
            lookup: HashMap::new(),
            built: false,
        }
    }

    /// The number of nodes (rows) of the pattern.
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Declares the symmetric pair of off-diagonal entries `(a, b)` and `(b, a)`.
    ///
    /// Idempotent per unordered pair. Fails with a frozen error once
    /// [`SparsityBuilder::build`] ran.
    pub fn add_edge(&mut self, a: u32, b: u32) -> ClothResult<()> {
        if self.built {
            return Err(ClothError::Frozen(
                "cannot add edges to a built sparsity pattern".to_string(),
            ));
        }
        if a == b {
            // Diagonal blocks live in their own buffer.
            return Ok(());
        }
        self.adjacency[a as usize].insert(b);
        self.adjacency[b as usize].insert(a);
        Ok(())
    }

    /// Finalizes the pattern, computing `row_ptr`, `col_idx`, and the lookup.
    ///
    /// Within each row, columns appear in ascending order, so the resulting
    /// pattern is identical for any insertion order of the same edge set.
    pub fn build(&mut self) {
        if self.built {
            return;
        }
        self.row_ptr = Vec::with_capacity(self.adjacency.len() + 1);
        self.row_ptr.push(0);
        for (i, neighbors) in self.adjacency.iter().enumerate() {
            for &j in neighbors {
                self.lookup
                    .insert((i as u32, j), self.col_idx.len() as u32);
                self.col_idx.push(j);
            }
            self.row_ptr.push(self.col_idx.len() as u32);
        }
        self.built = true;
    }

    /// The nnz index of entry `(row, col)`, if it was declared.
    pub fn csr_index(&self, row: u32, col: u32) -> Option<u32> {
        self.lookup.get(&(row, col)).copied()
    }

    /// The number of declared off-diagonal entries.
    pub fn nnz(&self) -> u32 {
        self.col_idx.len() as u32
    }

    /// The row-pointer array (`node_count + 1` entries after build).
    pub fn row_ptr(&self) -> &[u32] {
        &self.row_ptr
    }

    /// The per-row column indices.
    pub fn col_idx(&self) -> &[u32] {
        &self.col_idx
    }

    /// Multiplies the pattern against dense per-node vectors on the CPU.
    ///
    /// Reference implementation of the GPU SpMV used by tests: `out[i] =
    /// diag[i] * v[i] + Σ values[k] * v[col_idx[k]]` with 3×3 row-major
    /// blocks.
    pub fn spmv_cpu(
        &self,
        diag: &[f32],
        values: &[f32],
        v: &[nalgebra::Vector3<f32>],
    ) -> Vec<nalgebra::Vector3<f32>> {
        let n = self.node_count();
        let mut out = vec![nalgebra::Vector3::zeros(); n];
        for i in 0..n {
            let mut acc = block_mul(&diag[i * 9..i * 9 + 9], &v[i]);
            for k in self.row_ptr[i] as usize..self.row_ptr[i + 1] as usize {
                let j = self.col_idx[k] as usize;
                acc += block_mul(&values[k * 9..k * 9 + 9], &v[j]);
            }
            out[i] = acc;
        }
        out
    }
}

fn block_mul(block: &[f32], v: &nalgebra::Vector3<f32>) -> nalgebra::Vector3<f32> {
    nalgebra::Vector3::new(
        block[0] * v.x + block[1] * v.y + block[2] * v.z,
        block[3] * v.x + block[4] * v.y + block[5] * v.z,
        block[6] * v.x + block[7] * v.y + block[8] * v.z,
    )
}

#[cfg(test)]
mod test {
    use super::SparsityBuilder;
    use wgcloth_core::ClothError;

    #[test]
    fn triangle_pattern() {
        let mut builder = SparsityBuilder::new(3);
        builder.add_edge(0, 1).unwrap();
        builder.add_edge(1, 2).unwrap();
        builder.add_edge(2, 0).unwrap();
        builder.build();

        assert_eq!(builder.row_ptr(), &[0, 2, 4, 6]);
        assert_eq!(builder.col_idx(), &[1, 2, 0, 2, 0, 1]);
        assert_eq!(builder.nnz(), 6);
    }

    #[test]
    fn pattern_is_order_independent() {
        let orders: [&[(u32, u32)]; 2] = [&[(0, 1), (1, 2), (2, 0)], &[(2, 0), (0, 1), (1, 2)]];
        let mut patterns = Vec::new();
        for edges in orders {
            let mut builder = SparsityBuilder::new(3);
            for &(a, b) in edges {
                builder.add_edge(a, b).unwrap();
            }
            builder.build();
            patterns.push((builder.row_ptr().to_vec(), builder.col_idx().to_vec()));
        }
        assert_eq!(patterns[0], patterns[1]);
        assert_eq!(patterns[0].0, vec![0, 2, 4, 6]);
        assert_eq!(patterns[0].1, vec![1, 2, 0, 2, 0, 1]);
    }

    #[test]
    fn edges_are_symmetric_and_idempotent() {
        let mut builder = SparsityBuilder::new(4);
        builder.add_edge(1, 3).unwrap();
        builder.add_edge(3, 1).unwrap();
        builder.add_edge(1, 3).unwrap();
        builder.build();

        assert_eq!(builder.nnz(), 2);
        assert!(builder.csr_index(1, 3).is_some());
        assert!(builder.csr_index(3, 1).is_some());
        assert_eq!(builder.csr_index(0, 1), None);
    }

    #[test]
    fn row_ptr_invariants() {
        let mut builder = SparsityBuilder::new(5);
        builder.add_edge(0, 4).unwrap();
        builder.add_edge(2, 3).unwrap();
        builder.add_edge(0, 2).unwrap();
        builder.build();

        let row_ptr = builder.row_ptr();
        assert_eq!(row_ptr.len(), 6);
        assert_eq!(*row_ptr.last().unwrap(), builder.nnz());
        for w in row_ptr.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn lookup_inverts_col_idx() {
        let mut builder = SparsityBuilder::new(4);
        builder.add_edge(0, 1).unwrap();
        builder.add_edge(0, 2).unwrap();
        builder.add_edge(1, 2).unwrap();
        builder.add_edge(2, 3).unwrap();
        builder.build();

        for i in 0..4u32 {
            for k in builder.row_ptr()[i as usize]..builder.row_ptr()[i as usize + 1] {
                let j = builder.col_idx()[k as usize];
                assert_eq!(builder.csr_index(i, j), Some(k));
            }
        }
    }

    #[test]
    fn build_freezes_the_pattern() {
        let mut builder = SparsityBuilder::new(2);
        builder.add_edge(0, 1).unwrap();
        builder.build();
        assert!(matches!(
            builder.add_edge(0, 1),
            Err(ClothError::Frozen(_))
        ));
    }

    #[test]
    fn self_edges_are_ignored() {
        let mut builder = SparsityBuilder::new(2);
        builder.add_edge(1, 1).unwrap();
        builder.build();
        assert_eq!(builder.nnz(), 0);
    }
}
