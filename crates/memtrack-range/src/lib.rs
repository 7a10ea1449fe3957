//! Non-overlapping address interval index.
//!
//! [`NonOverlappingRangeList`] keeps a set of pairwise disjoint address
//! ranges ordered by start address. Besides plain insertion and removal it
//! can make sure a range is covered exactly by its items, splitting items
//! that stick out of the range and creating new ones for the gaps
//! ([`get_or_insert_with`]). Adjacent items that have become equivalent can
//! be joined back together ([`coalesce`]).
//!
//! [`get_or_insert_with`]: NonOverlappingRangeList::get_or_insert_with
//! [`coalesce`]: NonOverlappingRangeList::coalesce

use std::collections::BTreeMap;

use memtrack_core::{AddressRange, Va};

/// An item that occupies an address range.
pub trait RangeItem: Sized {
    /// Returns the range occupied by the item.
    fn range(&self) -> AddressRange;

    /// Splits the item at `at`.
    ///
    /// `self` is shrunk to `[start, at)` and the returned item covers
    /// `[at, end)`. `at` is strictly inside the item.
    fn split(&mut self, at: Va) -> Self;

    /// Checks if `next`, which starts where `self` ends, may be absorbed
    /// into `self`.
    fn can_join(&self, next: &Self) -> bool;

    /// Absorbs `next` into `self`, extending it to the end of `next`.
    ///
    /// Only called when [`can_join`](Self::can_join) allowed it.
    fn join(&mut self, next: Self);
}

/// A list of non-overlapping ranges, ordered by address.
pub struct NonOverlappingRangeList<T>
where
    T: RangeItem,
{
    /// Items keyed by their start address.
    items: BTreeMap<Va, T>,
}

impl<T> Default for NonOverlappingRangeList<T>
where
    T: RangeItem,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NonOverlappingRangeList<T>
where
    T: RangeItem,
{
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Checks if the list holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates over all items in address order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Iterates mutably over all items in address order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }

    /// Returns the item containing `address`.
    #[cfg(test)]
    fn get(&self, address: Va) -> Option<&T> {
        let (_, item) = self.items.range(..=address).next_back()?;
        item.range().contains(address).then_some(item)
    }

    /// Inserts an item.
    ///
    /// Returns the item back if it is empty or overlaps an existing one.
    #[cfg(test)]
    fn insert(&mut self, item: T) -> Result<(), T> {
        let range = item.range();

        if range.is_empty() || self.overlaps(range).next().is_some() {
            return Err(item);
        }

        self.items.insert(range.address, item);
        Ok(())
    }

    /// Removes the item starting at `address`.
    pub fn remove(&mut self, address: Va) -> Option<T> {
        self.items.remove(&address)
    }

    /// Iterates, in address order, over every item intersecting `range`.
    pub fn overlaps(&self, range: AddressRange) -> impl Iterator<Item = &T> {
        let first = self.first_overlapping_key(range);
        self.items.range(first..range.end()).map(|(_, item)| item)
    }

    /// Iterates mutably, in address order, over every item intersecting
    /// `range`.
    pub fn overlaps_mut(&mut self, range: AddressRange) -> impl Iterator<Item = &mut T> {
        let first = self.first_overlapping_key(range);
        self.items.range_mut(first..range.end()).map(|(_, item)| item)
    }

    /// Makes sure `range` is covered exactly by items and iterates over them.
    ///
    /// Items that stick out of `range` are split at its boundaries, and
    /// `factory` is called for every uncovered gap. The returned items are
    /// pairwise disjoint, ordered by address, and their union is `range`.
    pub fn get_or_insert_with(
        &mut self,
        range: AddressRange,
        mut factory: impl FnMut(AddressRange) -> T,
    ) -> impl Iterator<Item = &mut T> {
        if !range.is_empty() {
            self.split_at(range.address);
            self.split_at(range.end());

            let end = range.end();
            let mut cursor = range.address;

            while cursor < end {
                let next = self
                    .items
                    .range(cursor..end)
                    .next()
                    .map(|(&start, item)| (start, item.range().end()));

                match next {
                    Some((start, item_end)) => {
                        if start > cursor {
                            self.items
                                .insert(cursor, factory(AddressRange::from_bounds(cursor, start)));
                        }

                        cursor = item_end;
                    }
                    None => {
                        self.items
                            .insert(cursor, factory(AddressRange::from_bounds(cursor, end)));

                        cursor = end;
                    }
                }
            }
        }

        self.overlaps_mut(range)
    }

    /// Joins adjacent items in and around `range` wherever
    /// [`RangeItem::can_join`] allows it.
    ///
    /// Items bordering `range` on either side are considered too. Returns
    /// the number of joins.
    pub fn coalesce(&mut self, range: AddressRange) -> usize {
        let mut cursor = match self.items.range(..range.address).next_back() {
            Some((&start, _)) => start,
            None => range.address,
        };

        let mut joined = 0;

        loop {
            let Some((start, end)) = self
                .items
                .range(cursor..)
                .next()
                .map(|(&start, item)| (start, item.range().end()))
            else {
                break;
            };

            if end > range.end() {
                break;
            }

            let joinable = match (self.items.get(&start), self.items.get(&end)) {
                (Some(item), Some(next)) => item.can_join(next),
                _ => false,
            };

            if !joinable {
                cursor = end;
                continue;
            }

            if let Some(next) = self.items.remove(&end) {
                if let Some(item) = self.items.get_mut(&start) {
                    item.join(next);
                    joined += 1;
                }
            }

            cursor = start;
        }

        joined
    }

    /// Returns the key from which an overlap scan for `range` has to start.
    ///
    /// The item starting at or before `range.address` is included only when
    /// it reaches into the range. An empty range overlaps nothing.
    fn first_overlapping_key(&self, range: AddressRange) -> Va {
        if range.is_empty() {
            return range.address;
        }

        match self.items.range(..=range.address).next_back() {
            Some((&start, item)) if item.range().end() > range.address => start,
            _ => range.address,
        }
    }

    /// Splits the item strictly containing `at`, if any.
    fn split_at(&mut self, at: Va) {
        let Some((_, item)) = self.items.range_mut(..at).next_back() else {
            return;
        };

        if item.range().end() <= at {
            return;
        }

        let tail = item.split(at);
        debug_assert_eq!(tail.range().address, at);
        self.items.insert(at, tail);
    }
}

impl<T> std::fmt::Debug for NonOverlappingRangeList<T>
where
    T: RangeItem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list()
            .entries(self.items.values().map(|item| item.range()))
            .finish()
    }
}
