//! Dedup Buffer
//!
//! Ordered, cid-unique collection of comments for one tab session.

use std::collections::HashSet;

use super::types::Comment;

/// Append-only comment buffer keyed by `cid`.
///
/// The presence set mirrors `comments` exactly; both are only touched by
/// [`DedupBuffer::merge`] and [`DedupBuffer::clear`].
#[derive(Debug, Clone, Default)]
pub struct DedupBuffer {
    comments: Vec<Comment>,
    seen: HashSet<String>,
}

impl DedupBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every incoming comment whose cid is not present yet.
    ///
    /// Survivors keep their arrival order and land after the existing
    /// entries. Duplicates inside `incoming` itself collapse to the first
    /// occurrence. Returns how many comments were appended.
    pub fn merge<I>(&mut self, incoming: I) -> usize
    where
        I: IntoIterator<Item = Comment>,
    {
        let before = self.comments.len();
        for comment in incoming {
            if self.seen.insert(comment.cid.clone()) {
                self.comments.push(comment);
            }
        }
        self.comments.len() - before
    }

    /// Drop everything; used when the tab moves to a different subject
    pub fn clear(&mut self) {
        self.comments.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn contains(&self, cid: &str) -> bool {
        self.seen.contains(cid)
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    /// Owned copy of the current contents, in insertion order
    pub fn snapshot(&self) -> Vec<Comment> {
        self.comments.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(items: &[(&str, &str)]) -> Vec<Comment> {
        items.iter().map(|(cid, text)| Comment::new(*cid, *text)).collect()
    }

    #[test]
    fn test_merge_skips_existing() {
        let mut buffer = DedupBuffer::new();
        buffer.merge(batch(&[("1", "a")]));

        let appended = buffer.merge(batch(&[("1", "a"), ("2", "b")]));

        assert_eq!(appended, 1);
        assert_eq!(buffer.comments(), batch(&[("1", "a"), ("2", "b")]).as_slice());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut buffer = DedupBuffer::new();
        buffer.merge(batch(&[("9", "x")]));
        let incoming = batch(&[("3", "c"), ("9", "x"), ("4", "d")]);

        assert_eq!(buffer.merge(incoming.clone()), 2);
        let after_first = buffer.snapshot();
        assert_eq!(buffer.merge(incoming), 0);
        assert_eq!(buffer.snapshot(), after_first);
    }

    #[test]
    fn test_merge_preserves_batch_order() {
        let mut buffer = DedupBuffer::new();
        buffer.merge(batch(&[("b1", "first"), ("b2", "second")]));
        buffer.merge(batch(&[("c1", "third"), ("c2", "fourth")]));

        let cids: Vec<&str> = buffer.comments().iter().map(|c| c.cid.as_str()).collect();
        assert_eq!(cids, vec!["b1", "b2", "c1", "c2"]);
    }

    #[test]
    fn test_duplicates_within_batch_collapse() {
        let mut buffer = DedupBuffer::new();
        let appended = buffer.merge(batch(&[("5", "first"), ("5", "again"), ("6", "other")]));

        assert_eq!(appended, 2);
        assert_eq!(buffer.comments()[0].text, "first");
    }

    #[test]
    fn test_uniqueness_over_many_merges() {
        let mut buffer = DedupBuffer::new();
        for round in 0..20u32 {
            let incoming: Vec<Comment> = (0..10u32)
                .map(|i| Comment::new(((round * 3 + i) % 25).to_string(), "t"))
                .collect();
            buffer.merge(incoming);
        }

        let unique: HashSet<&str> = buffer.comments().iter().map(|c| c.cid.as_str()).collect();
        assert_eq!(unique.len(), buffer.len());
        assert_eq!(buffer.len(), 25);
    }

    #[test]
    fn test_clear_resets_presence() {
        let mut buffer = DedupBuffer::new();
        buffer.merge(batch(&[("1", "a"), ("2", "b")]));
        buffer.clear();

        assert!(buffer.is_empty());
        assert!(!buffer.contains("1"));
        assert_eq!(buffer.merge(batch(&[("1", "a")])), 1);
    }
}
