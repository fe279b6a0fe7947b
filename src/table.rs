//! A row container with a unique primary index and secondary sorted indexes.

use crate::error::{Error, Result};
use crate::index::{RowCmp, SortedIndex};
use std::cmp::Ordering;

/// Id of the primary index.
pub const INDEX_PRIMARY: usize = 0;

/// Rows plus one or more orderings over them.
///
/// The table owns the rows; each index holds sorted positions into the row
/// store. Deleting never compacts the store, so positions stay stable and
/// unreferenced rows are simply dead weight.
pub struct Table<R> {
    rows: Vec<R>,
    indexes: Vec<SortedIndex<R>>,
}

impl<R: Copy> Table<R> {
    /// Creates a table whose primary index orders rows by `primary`.
    ///
    /// The primary comparator must be unique over live rows.
    pub fn new(primary: RowCmp<R>) -> Self {
        Self {
            rows: Vec::new(),
            indexes: vec![SortedIndex::new(primary)],
        }
    }

    /// Adds a secondary index and returns its id.
    ///
    /// Only allowed while the table is empty.
    pub fn add_index(&mut self, cmp: RowCmp<R>) -> Result<usize> {
        if !self.rows.is_empty() {
            return Err(Error::Invalid);
        }
        self.indexes.push(SortedIndex::new(cmp));
        Ok(self.indexes.len() - 1)
    }

    fn index(&self, index_id: usize) -> Result<&SortedIndex<R>> {
        self.indexes.get(index_id).ok_or(Error::Invalid)
    }

    fn append(&mut self, row: R) {
        let pos = self.rows.len();
        self.rows.push(row);
        let Self { rows, indexes } = self;
        for index in indexes.iter_mut() {
            index.insert(rows, pos);
        }
    }

    fn resort(&mut self) {
        let Self { rows, indexes } = self;
        for index in indexes.iter_mut() {
            index.sort(rows);
        }
    }

    /// Inserts `row`; fails with EXISTS when the primary key is taken.
    pub fn insert(&mut self, row: R) -> Result<()> {
        match self.indexes[INDEX_PRIMARY].find(&self.rows, &row) {
            Ok(_) => Err(Error::Exists),
            Err(Error::NotFound) => {
                self.append(row);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Inserts `row`, overwriting any row with the same primary key.
    ///
    /// An overwrite may change secondary keys, so every index is re-sorted.
    pub fn insert_or_replace(&mut self, row: R) -> Result<()> {
        match self.indexes[INDEX_PRIMARY].find(&self.rows, &row) {
            Ok(pos) => {
                self.rows[pos] = row;
                self.resort();
                Ok(())
            }
            Err(Error::NotFound) => {
                self.append(row);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns a copy of the leftmost row matched by `filter` on an index.
    pub fn first<F>(&self, index_id: usize, filter: F) -> Result<R>
    where
        F: Fn(&R) -> Ordering,
    {
        let pos = self.index(index_id)?.first(&self.rows, filter)?;
        Ok(self.rows[pos])
    }

    /// Returns a copy of the rightmost row matched by `filter` on an index.
    pub fn last<F>(&self, index_id: usize, filter: F) -> Result<R>
    where
        F: Fn(&R) -> Ordering,
    {
        let pos = self.index(index_id)?.last(&self.rows, filter)?;
        Ok(self.rows[pos])
    }

    /// Visits every matching row in index order.
    pub fn each<F, C>(&self, index_id: usize, filter: F, mut each: C) -> Result<()>
    where
        F: Fn(&R) -> Ordering,
        C: FnMut(&R),
    {
        self.index(index_id)?
            .each(&self.rows, filter, |pos| each(&self.rows[pos]))
    }

    /// Visits every matching row, re-ordered by `order`, smallest first.
    pub fn each_ordered<F, C>(
        &self,
        index_id: usize,
        filter: F,
        order: RowCmp<R>,
        mut each: C,
    ) -> Result<()>
    where
        F: Fn(&R) -> Ordering,
        C: FnMut(&R),
    {
        let mut matched: Vec<R> = Vec::new();
        self.each(index_id, filter, |row| matched.push(*row))?;
        matched.sort_by(|a, b| order(a, b));
        for row in &matched {
            each(row);
        }
        Ok(())
    }

    /// Counts matching rows; an empty match is zero.
    pub fn count<F>(&self, index_id: usize, filter: F) -> Result<usize>
    where
        F: Fn(&R) -> Ordering,
    {
        match self.index(index_id)?.range(&self.rows, filter) {
            Ok(range) => Ok(range.len()),
            Err(Error::NotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Applies `mutate` to every matching row, then re-sorts all indexes.
    ///
    /// An empty match set is a success.
    pub fn update<F, M>(&mut self, index_id: usize, filter: F, mut mutate: M) -> Result<()>
    where
        F: Fn(&R) -> Ordering,
        M: FnMut(&mut R),
    {
        let index = self.index(index_id)?;
        let matched: Vec<usize> = match index.range(&self.rows, &filter) {
            Ok(range) => range.map(|slot| index.positions()[slot]).collect(),
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        for &pos in &matched {
            mutate(&mut self.rows[pos]);
        }
        self.resort();
        Ok(())
    }

    /// Unlinks every matching row from all indexes.
    ///
    /// The row store is left uncompacted; unreferenced rows are harmless.
    pub fn delete<F>(&mut self, index_id: usize, filter: F) -> Result<()>
    where
        F: Fn(&R) -> Ordering,
    {
        let index = self.index(index_id)?;
        let mut matched: Vec<usize> = index
            .range(&self.rows, &filter)?
            .map(|slot| index.positions()[slot])
            .collect();
        matched.sort_unstable();
        for index in &mut self.indexes {
            index.delete(|pos| matched.binary_search(&pos).is_ok());
        }
        Ok(())
    }

    /// Visits every row reachable through an index, in index order.
    pub fn each_by_index<C>(&self, index_id: usize, mut each: C) -> Result<()>
    where
        C: FnMut(&R),
    {
        for &pos in self.index(index_id)?.positions() {
            each(&self.rows[pos]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Row {
        id: u32,
        group: u32,
    }

    fn by_id(a: &Row, b: &Row) -> Ordering {
        a.id.cmp(&b.id)
    }

    fn by_group(a: &Row, b: &Row) -> Ordering {
        a.group.cmp(&b.group).then(a.id.cmp(&b.id))
    }

    fn table() -> Table<Row> {
        let mut table = Table::new(by_id);
        table.add_index(by_group).unwrap();
        table
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut table = table();
        table.insert(Row { id: 1, group: 10 }).unwrap();
        table.insert(Row { id: 2, group: 10 }).unwrap();
        assert!(matches!(
            table.insert(Row { id: 1, group: 99 }),
            Err(Error::Exists)
        ));
    }

    #[test]
    fn add_index_requires_empty() {
        let mut table = table();
        table.insert(Row { id: 1, group: 10 }).unwrap();
        assert!(matches!(table.add_index(by_group), Err(Error::Invalid)));
    }

    #[test]
    fn replace_resorts_secondary() {
        let mut table = table();
        table.insert(Row { id: 1, group: 10 }).unwrap();
        table.insert(Row { id: 2, group: 20 }).unwrap();
        table.insert_or_replace(Row { id: 1, group: 30 }).unwrap();

        let mut groups = Vec::new();
        table
            .each_by_index(1, |row| groups.push(row.group))
            .unwrap();
        assert_eq!(groups, vec![20, 30]);
    }

    #[test]
    fn query_by_secondary() {
        let mut table = table();
        for id in 1..=6 {
            table.insert(Row { id, group: id % 2 }).unwrap();
        }
        let odd = |row: &Row| row.group.cmp(&1);
        assert_eq!(table.count(1, odd).unwrap(), 3);
        assert_eq!(table.first(1, odd).unwrap().id, 1);
        assert_eq!(table.last(1, odd).unwrap().id, 5);
        assert_eq!(table.count(1, |row: &Row| row.group.cmp(&7)).unwrap(), 0);
    }

    #[test]
    fn update_moves_rows_between_groups() {
        let mut table = table();
        table.insert(Row { id: 1, group: 10 }).unwrap();
        table.insert(Row { id: 2, group: 10 }).unwrap();
        table.insert(Row { id: 3, group: 20 }).unwrap();

        table
            .update(1, |row: &Row| row.group.cmp(&10), |row| row.group = 30)
            .unwrap();

        let mut rows = Vec::new();
        table
            .each_by_index(1, |row| rows.push((row.group, row.id)))
            .unwrap();
        assert_eq!(rows, vec![(20, 3), (30, 1), (30, 2)]);
    }

    #[test]
    fn delete_keeps_store_positions() {
        let mut table = table();
        table.insert(Row { id: 1, group: 10 }).unwrap();
        table.insert(Row { id: 2, group: 20 }).unwrap();
        table.insert(Row { id: 3, group: 20 }).unwrap();

        table.delete(1, |row: &Row| row.group.cmp(&20)).unwrap();
        assert!(matches!(
            table.first(0, |row: &Row| row.id.cmp(&2)),
            Err(Error::NotFound)
        ));
        // Remaining rows are still reachable after the holes.
        assert_eq!(table.first(0, |row: &Row| row.id.cmp(&1)).unwrap().id, 1);

        // Positions stayed stable: a new row lands after the dead ones.
        table.insert(Row { id: 4, group: 40 }).unwrap();
        assert_eq!(table.first(0, |row: &Row| row.id.cmp(&4)).unwrap().group, 40);
    }

    #[test]
    fn each_ordered_reorders_matches() {
        let mut table = table();
        table.insert(Row { id: 3, group: 10 }).unwrap();
        table.insert(Row { id: 1, group: 10 }).unwrap();
        table.insert(Row { id: 2, group: 10 }).unwrap();

        let mut ids = Vec::new();
        table
            .each_ordered(
                1,
                |row: &Row| row.group.cmp(&10),
                |a, b| b.id.cmp(&a.id),
                |row| ids.push(row.id),
            )
            .unwrap();
        assert_eq!(ids, vec![3, 2, 1]);
    }
}
