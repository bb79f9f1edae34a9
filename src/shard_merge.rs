//! Implements a merge tree to merge an arbitrary number of sorted map outputs.
//! Genericized in order to build arbitrary merge trees.
//!
//! Inputs are streams of `Result<T>`; an error from any input is yielded as
//! soon as it is peeked, ahead of the pending values.

use crate::error::Result;
use crate::record_types::Keyed;

use std::iter;

type Source<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// See module description.
/// This type uses dynamic instead of static dispatch because it realizes an arbitrary structure
/// and can therefore not work with a single type signature.
///
/// Ties are resolved in favor of the left input, so values with equal keys
/// come out in the order of the sources passed to [`build`](Self::build).
pub struct ShardMergeIterator<'a, T> {
    left: Source<'a, T>,
    right: Source<'a, T>,

    left_peeked: Option<Result<T>>,
    right_peeked: Option<Result<T>>,
}

impl<'a, T: Keyed> Iterator for ShardMergeIterator<'a, T> {
    type Item = Result<T>;
    fn next(&mut self) -> Option<Self::Item> {
        // fill up
        if self.left_peeked.is_none() {
            self.left_peeked = self.left.next();
        }
        if self.right_peeked.is_none() {
            self.right_peeked = self.right.next();
        }

        // Consume peeked values
        match (&self.left_peeked, &self.right_peeked) {
            (None, None) => None,
            (Some(_), None) | (Some(Err(_)), _) => self.left_peeked.take(),
            (None, Some(_)) | (_, Some(Err(_))) => self.right_peeked.take(),
            (Some(Ok(l)), Some(Ok(r))) => {
                if l.key() <= r.key() {
                    self.left_peeked.take()
                } else {
                    self.right_peeked.take()
                }
            }
        }
    }
}

impl<'a, T: Keyed + 'a> ShardMergeIterator<'a, T> {
    fn pair(left: Source<'a, T>, right: Source<'a, T>) -> ShardMergeIterator<'a, T> {
        ShardMergeIterator {
            left,
            right,
            left_peeked: None,
            right_peeked: None,
        }
    }

    /// Takes multiple sorted iterators of type It and generates one ShardMergeIterator
    /// (yes, iterator over a collection of iterators).
    pub fn build<It, ItIt>(sources: ItIt) -> ShardMergeIterator<'a, T>
    where
        It: Iterator<Item = Result<T>> + 'a,
        ItIt: IntoIterator<Item = It>,
    {
        let mut sources = sources.into_iter();
        let mut merged: Vec<ShardMergeIterator<'a, T>> = Vec::new();

        // Initial merging: Merge pairs of input iterators together.
        while let Some(src1) = sources.next() {
            let src2: Source<'a, T> = match sources.next() {
                None => Box::new(iter::empty()),
                Some(src) => Box::new(src),
            };
            merged.push(ShardMergeIterator::pair(Box::new(src1), src2));
        }

        // Recursively build the merge tree from the leaves.
        ShardMergeIterator::merge(merged)
    }

    /// Merge multiple ShardMergeIterators, recursively (meaning it will result in a more or less
    /// balanced merge sort tree).
    fn merge(mut its: Vec<ShardMergeIterator<'a, T>>) -> ShardMergeIterator<'a, T> {
        match its.len() {
            0 => ShardMergeIterator::pair(Box::new(iter::empty()), Box::new(iter::empty())),
            1 => its.remove(0),
            _ => {
                // its is left part, right is right part
                let split_at = its.len() / 2;
                let right = its.split_off(split_at);
                ShardMergeIterator::pair(
                    Box::new(ShardMergeIterator::merge(its)),
                    Box::new(ShardMergeIterator::merge(right)),
                )
            }
        }
    }
}
