//! Sub-range view over another storage.
//!
//! The window is resolved to index space once at construction; afterwards
//! the adapter is just an index translation and owns no data. An upper bound
//! that names an existing item exactly is inclusive, which works because
//! items are unique.

use crate::storage::{check_range, Storage};
use crate::types::{Bound, Fingerprint, Item};
use crate::{Error, Result};

pub struct SubRange<'a, S: Storage> {
    base: &'a S,
    sub_begin: usize,
    sub_end: usize,
}

impl<'a, S: Storage> SubRange<'a, S> {
    pub fn new(base: &'a S, lower: Bound, upper: Bound) -> Result<Self> {
        let base_size = base.size();

        let sub_begin = if lower == Bound::zero() {
            0
        } else {
            base.find_lower_bound(0, &lower)?
        };

        let mut sub_end = if upper == Bound::infinite() {
            base_size
        } else {
            base.find_lower_bound(sub_begin, &upper)?
        };

        if sub_end < base_size && base.get_item(sub_end)? == *upper.as_item() {
            sub_end += 1;
        }

        Ok(SubRange {
            base,
            sub_begin,
            sub_end,
        })
    }
}

impl<S: Storage> Storage for SubRange<'_, S> {
    fn size(&self) -> usize {
        self.sub_end - self.sub_begin
    }

    fn get_item(&self, index: usize) -> Result<Item> {
        if index >= self.size() {
            return Err(Error::OutOfRange);
        }
        self.base.get_item(self.sub_begin + index)
    }

    fn iterate<F>(&self, begin: usize, end: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&Item, usize) -> bool,
    {
        check_range(begin, end, self.size())?;

        let sub_begin = self.sub_begin;
        self.base
            .iterate(sub_begin + begin, sub_begin + end, |item, base_index| {
                f(item, base_index - sub_begin)
            })
    }

    fn find_lower_bound(&self, begin: usize, bound: &Bound) -> Result<usize> {
        if begin > self.size() {
            return Err(Error::BadRange);
        }

        let found = self.base.find_lower_bound(self.sub_begin + begin, bound)?;
        if found >= self.sub_end {
            Ok(self.size())
        } else {
            Ok(found - self.sub_begin)
        }
    }

    fn fingerprint(&self, begin: usize, end: usize) -> Result<Fingerprint> {
        check_range(begin, end, self.size())?;
        self.base
            .fingerprint(self.sub_begin + begin, self.sub_begin + end)
    }
}
