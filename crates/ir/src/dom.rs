//! Dominator-tree analysis.
//!
//! Iterative dataflow over reverse postorder (Cooper/Harvey/Kennedy). Block
//! A dominates B when every path from the entry to B passes through A; the
//! verifier and the code extractor both consume this.

use crate::function::Function;
use crate::types::BlockId;
use std::collections::HashMap;

pub struct DomTree {
    /// Immediate dominator per block; the entry maps to itself.
    idom: HashMap<BlockId, BlockId>,
    /// Position of each reachable block in reverse postorder.
    rpo_pos: HashMap<BlockId, usize>,
}

impl DomTree {
    pub fn compute(func: &Function) -> DomTree {
        let mut tree = DomTree {
            idom: HashMap::new(),
            rpo_pos: HashMap::new(),
        };
        let Some(entry) = func.entry() else {
            return tree;
        };

        let rpo = reverse_postorder(func, entry);
        for (i, &bb) in rpo.iter().enumerate() {
            tree.rpo_pos.insert(bb, i);
        }

        let mut preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for &bb in &rpo {
            for succ in func.successors(bb) {
                preds.entry(succ).or_default().push(bb);
            }
        }

        tree.idom.insert(entry, entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &bb in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &p in preds.get(&bb).map(Vec::as_slice).unwrap_or(&[]) {
                    if !tree.idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => tree.intersect(p, cur),
                    });
                }
                if let Some(candidate) = new_idom {
                    if tree.idom.get(&bb) != Some(&candidate) {
                        tree.idom.insert(bb, candidate);
                        changed = true;
                    }
                }
            }
        }
        tree
    }

    fn intersect(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            while self.rpo_pos[&a] > self.rpo_pos[&b] {
                a = self.idom[&a];
            }
            while self.rpo_pos[&b] > self.rpo_pos[&a] {
                b = self.idom[&b];
            }
        }
        a
    }

    pub fn is_reachable(&self, bb: BlockId) -> bool {
        self.rpo_pos.contains_key(&bb)
    }

    pub fn idom(&self, bb: BlockId) -> Option<BlockId> {
        let idom = *self.idom.get(&bb)?;
        (idom != bb).then_some(idom)
    }

    /// Reflexive dominance on reachable blocks.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut x = b;
        loop {
            if x == a {
                return true;
            }
            let up = self.idom[&x];
            if up == x {
                return false;
            }
            x = up;
        }
    }
}

fn reverse_postorder(func: &Function, entry: BlockId) -> Vec<BlockId> {
    let mut visited: Vec<BlockId> = Vec::new();
    let mut post: Vec<BlockId> = Vec::new();
    // Explicit stack with a visit/finish marker to get a true postorder.
    let mut stack: Vec<(BlockId, bool)> = vec![(entry, false)];
    while let Some((bb, finished)) = stack.pop() {
        if finished {
            post.push(bb);
            continue;
        }
        if visited.contains(&bb) {
            continue;
        }
        visited.push(bb);
        stack.push((bb, true));
        for succ in func.successors(bb).into_iter().rev() {
            if !visited.contains(&succ) {
                stack.push((succ, false));
            }
        }
    }
    post.reverse();
    post
}
