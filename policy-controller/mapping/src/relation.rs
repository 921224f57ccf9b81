use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::hash::Hash;

/// A many-to-many relation indexed in both directions.
#[derive(Clone, Debug)]
pub(crate) struct Relation<A, B> {
    forward: HashMap<A, HashSet<B>>,
    reverse: HashMap<B, HashSet<A>>,
}

// === impl Relation ===

impl<A, B> Default for Relation<A, B> {
    fn default() -> Self {
        Self {
            forward: HashMap::default(),
            reverse: HashMap::default(),
        }
    }
}

impl<A, B> Relation<A, B>
where
    A: Clone + Eq + Hash + Ord,
    B: Clone + Eq + Hash + Ord,
{
    pub(crate) fn link(&mut self, a: A, b: B) {
        self.forward.entry(a.clone()).or_default().insert(b.clone());
        self.reverse.entry(b).or_default().insert(a);
    }

    pub(crate) fn unlink(&mut self, a: &A, b: &B) {
        if let Some(bs) = self.forward.get_mut(a) {
            bs.remove(b);
            if bs.is_empty() {
                self.forward.remove(a);
            }
        }
        if let Some(as_) = self.reverse.get_mut(b) {
            as_.remove(a);
            if as_.is_empty() {
                self.reverse.remove(b);
            }
        }
    }

    /// Returns the targets related to `a`, sorted.
    pub(crate) fn get(&self, a: &A) -> Vec<B> {
        let mut bs = self
            .forward
            .get(a)
            .map(|bs| bs.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        bs.sort();
        bs
    }

    /// Returns the sources related to `b`, sorted.
    pub(crate) fn get_reverse(&self, b: &B) -> Vec<A> {
        let mut as_ = self
            .reverse
            .get(b)
            .map(|as_| as_.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        as_.sort();
        as_
    }

    pub(crate) fn has(&self, a: &A) -> bool {
        self.forward.contains_key(a)
    }

    /// Removes `b` and all of its links, returning its former sources.
    pub(crate) fn remove_reverse(&mut self, b: &B) -> Vec<A> {
        let as_ = self.get_reverse(b);
        for a in &as_ {
            self.unlink(a, b);
        }
        as_
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn links_both_directions() {
        let mut rel = Relation::<&str, u32>::default();
        rel.link("a", 2);
        rel.link("a", 1);
        rel.link("b", 1);
        assert_eq!(rel.get(&"a"), vec![1, 2]);
        assert_eq!(rel.get_reverse(&1), vec!["a", "b"]);

        rel.unlink(&"a", &1);
        assert_eq!(rel.get(&"a"), vec![2]);
        assert_eq!(rel.get_reverse(&1), vec!["b"]);

        assert_eq!(rel.remove_reverse(&1), vec!["b"]);
        assert!(!rel.has(&"b"));
        assert!(rel.get_reverse(&1).is_empty());
        assert!(rel.has(&"a"));
    }
}
