use itertools::Itertools;
use std::collections::BTreeSet;
use std::fmt::Display;

/// A partition of `0..n` into disjoint, non-empty blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    n: usize,
    elems: Vec<BTreeSet<usize>>,
}

impl Partition {
    /// The single-block partition of `0..n` (no blocks when `n == 0`).
    pub fn new(n: usize) -> Self {
        let elems = if n == 0 {
            vec![]
        } else {
            vec![(0..n).collect()]
        };
        Self { n, elems }
    }

    /// Groups `0..keys.len()` by key, blocks ordered by first occurrence.
    pub fn from_classes<K: Ord>(keys: &[K]) -> Self {
        let mut blocks: Vec<(&K, BTreeSet<usize>)> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match blocks.iter_mut().find(|(k, _)| *k == key) {
                Some((_, block)) => {
                    block.insert(i);
                }
                None => blocks.push((key, BTreeSet::from([i]))),
            }
        }
        Self {
            n: keys.len(),
            elems: blocks.into_iter().map(|(_, block)| block).collect(),
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn blocks(&self) -> &[BTreeSet<usize>] {
        &self.elems
    }

    /// Index of the block holding `x`.
    pub fn get_class(&self, x: usize) -> Option<usize> {
        self.elems.iter().position(|block| block.contains(&x))
    }

    pub fn equiv(&self, x: usize, y: usize) -> bool {
        match (self.get_class(x), self.get_class(y)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Replaces block `index` by the classes of `f` over its members. The new blocks go
    /// to the end, in order of first occurrence. Out-of-range indices leave the
    /// partition unchanged.
    pub fn split_at<K: Ord>(&self, index: usize, f: impl Fn(usize) -> K) -> Self {
        let Some(block) = self.elems.get(index) else {
            return self.clone();
        };
        let members: Vec<usize> = block.iter().copied().collect();
        let keys: Vec<K> = members.iter().map(|&x| f(x)).collect();
        let parts = Partition::from_classes(&keys);

        let mut elems: Vec<BTreeSet<usize>> = self
            .elems
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, b)| b.clone())
            .collect();
        elems.extend(
            parts
                .elems
                .into_iter()
                .map(|part| part.into_iter().map(|i| members[i]).collect()),
        );
        Self { n: self.n, elems }
    }

    /// At least as many blocks as `other`.
    pub fn refines(&self, other: &Partition) -> bool {
        self.len() >= other.len()
    }

    /// Every block of `self` lies inside some block of `other`.
    pub fn refines2(&self, other: &Partition) -> bool {
        self.elems
            .iter()
            .all(|block| other.elems.iter().any(|o| block.is_subset(o)))
    }

    /// Blocks are non-empty, pairwise disjoint and cover exactly `0..n`.
    pub fn is_valid(&self) -> bool {
        let mut seen = BTreeSet::new();
        for block in &self.elems {
            if block.is_empty() {
                return false;
            }
            for &x in block {
                if x >= self.n || !seen.insert(x) {
                    return false;
                }
            }
        }
        seen.len() == self.n
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}]",
            self.elems
                .iter()
                .map(|block| format!("{{{}}}", block.iter().join(", ")))
                .join(", ")
        )
    }
}
