//! Table ordering by foreign key dependency.
//!
//! Inserts must reach a referenced table before the tables that point at it.
//! [`DependencySorter`] produces that order:
//!
//! - self-references are ignored (same-table ordering is handled row by row
//!   in the flush engine)
//! - a cycle broken by at least one nullable foreign key is resolved by
//!   dropping the nullable edge
//! - a cycle made only of non-nullable foreign keys is a
//!   [`CyclicDependencyError`]

use entcache_core::{CyclicDependencyError, Error, TableRef};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
struct Dependency {
    from: &'static str,
    to: &'static str,
    nullable: bool,
}

/// Orders tables so referenced tables come before referencing ones.
#[derive(Debug, Default)]
pub struct DependencySorter {
    tables: Vec<TableRef>,
    dependencies: Vec<Dependency>,
}

impl DependencySorter {
    /// Create an empty sorter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sorter over `tables` using their declared foreign keys.
    ///
    /// Foreign keys pointing outside `tables` are ignored.
    pub fn with_foreign_keys(tables: &[TableRef]) -> Self {
        let mut sorter = Self::new();
        for table in tables {
            sorter.add_table(table);
        }
        for table in tables {
            for (column, fk) in table.foreign_keys() {
                sorter.add_dependency(table.name, fk.table, column.nullable);
            }
        }
        sorter
    }

    /// Add a table. Returns false if it was already present.
    pub fn add_table(&mut self, table: TableRef) -> bool {
        if self.contains(table.name) {
            return false;
        }
        self.tables.push(table);
        true
    }

    /// Record that `from` must be inserted after `to`.
    pub fn add_dependency(&mut self, from: &'static str, to: &'static str, nullable: bool) {
        if from == to {
            return;
        }
        self.dependencies.push(Dependency { from, to, nullable });
    }

    /// Check if a table has been added.
    pub fn contains(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t.name == table)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if no tables have been added.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Produce the insertion order.
    ///
    /// Ties keep the order tables were added in.
    pub fn sort(&self) -> Result<Vec<TableRef>, Error> {
        let mut remaining = self.tables.clone();
        let mut placed: HashSet<&'static str> = HashSet::new();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let pick = remaining
                .iter()
                .position(|t| self.is_ready(t.name, &placed, false))
                .or_else(|| {
                    let relaxed = remaining
                        .iter()
                        .position(|t| self.is_ready(t.name, &placed, true));
                    if let Some(idx) = relaxed {
                        tracing::warn!(
                            table = remaining[idx].name,
                            "Breaking table cycle through nullable foreign key"
                        );
                    }
                    relaxed
                });

            let Some(idx) = pick else {
                let tables = self.find_cycle(&remaining);
                return Err(Error::CyclicDependency(CyclicDependencyError { tables }));
            };

            let table = remaining.remove(idx);
            placed.insert(table.name);
            order.push(table);
        }

        tracing::trace!(
            order = ?order.iter().map(|t| t.name).collect::<Vec<_>>(),
            "Sorted tables by dependency"
        );
        Ok(order)
    }

    fn is_ready(&self, table: &str, placed: &HashSet<&'static str>, relaxed: bool) -> bool {
        self.dependencies
            .iter()
            .filter(|d| d.from == table && self.contains(d.to))
            .filter(|d| !(relaxed && d.nullable))
            .all(|d| placed.contains(d.to))
    }

    /// Find a cycle of non-nullable dependencies among `remaining`.
    fn find_cycle(&self, remaining: &[TableRef]) -> Vec<&'static str> {
        let names: HashSet<&'static str> = remaining.iter().map(|t| t.name).collect();
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for table in remaining {
            if !visited.contains(table.name)
                && self.detect_cycle_dfs(table.name, &names, &mut visited, &mut rec_stack, &mut path)
            {
                // path ends with the repeated table; drop the lead-in before the cycle
                let start = path
                    .last()
                    .and_then(|end| path.iter().position(|t| t == end))
                    .unwrap_or(0);
                return path.split_off(start);
            }
        }

        names.into_iter().collect()
    }

    fn detect_cycle_dfs(
        &self,
        table: &'static str,
        names: &HashSet<&'static str>,
        visited: &mut HashSet<&'static str>,
        rec_stack: &mut HashSet<&'static str>,
        path: &mut Vec<&'static str>,
    ) -> bool {
        visited.insert(table);
        rec_stack.insert(table);
        path.push(table);

        for dep in self
            .dependencies
            .iter()
            .filter(|d| d.from == table && !d.nullable && names.contains(d.to))
        {
            if !visited.contains(dep.to) {
                if self.detect_cycle_dfs(dep.to, names, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(dep.to) {
                path.push(dep.to);
                return true;
            }
        }

        rec_stack.remove(table);
        path.pop();
        false
    }
}

/// Sort `tables` by their declared foreign keys.
pub fn sort_tables(tables: &[TableRef]) -> Result<Vec<TableRef>, Error> {
    DependencySorter::with_foreign_keys(tables).sort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use entcache_core::{ColumnDef, SqlType, TableDef};

    const ID: ColumnDef = ColumnDef::new("id", SqlType::BigInt)
        .primary_key(true)
        .auto_increment(true);

    static TEAMS: TableDef = TableDef::new("teams", &[ID]);
    static USERS: TableDef = TableDef::new(
        "users",
        &[
            ID,
            ColumnDef::new("team_id", SqlType::BigInt).references("teams", "id"),
        ],
    );
    static POSTS: TableDef = TableDef::new(
        "posts",
        &[
            ID,
            ColumnDef::new("author_id", SqlType::BigInt).references("users", "id"),
            ColumnDef::new("parent_id", SqlType::BigInt)
                .nullable(true)
                .references("posts", "id"),
        ],
    );
    static EGG: TableDef = TableDef::new(
        "egg",
        &[
            ID,
            ColumnDef::new("chicken_id", SqlType::BigInt).references("chicken", "id"),
        ],
    );
    static CHICKEN: TableDef = TableDef::new(
        "chicken",
        &[
            ID,
            ColumnDef::new("egg_id", SqlType::BigInt).references("egg", "id"),
        ],
    );
    static HUSBAND: TableDef = TableDef::new(
        "husband",
        &[
            ID,
            ColumnDef::new("wife_id", SqlType::BigInt)
                .nullable(true)
                .references("wife", "id"),
        ],
    );
    static WIFE: TableDef = TableDef::new(
        "wife",
        &[
            ID,
            ColumnDef::new("husband_id", SqlType::BigInt).references("husband", "id"),
        ],
    );

    fn names(order: &[TableRef]) -> Vec<&'static str> {
        order.iter().map(|t| t.name).collect()
    }

    #[test]
    fn test_referenced_tables_come_first() {
        let order = sort_tables(&[&POSTS, &USERS, &TEAMS]).unwrap();
        assert_eq!(names(&order), vec!["teams", "users", "posts"]);

        let order = sort_tables(&[&TEAMS, &POSTS, &USERS]).unwrap();
        assert_eq!(names(&order), vec!["teams", "users", "posts"]);
    }

    #[test]
    fn test_self_reference_does_not_block() {
        let order = sort_tables(&[&POSTS]).unwrap();
        assert_eq!(names(&order), vec!["posts"]);
    }

    #[test]
    fn test_unknown_targets_are_ignored() {
        let order = sort_tables(&[&POSTS, &TEAMS]).unwrap();
        assert_eq!(names(&order), vec!["posts", "teams"]);
    }

    #[test]
    fn test_nullable_edge_breaks_cycle() {
        let order = sort_tables(&[&HUSBAND, &WIFE]).unwrap();
        assert_eq!(names(&order), vec!["husband", "wife"]);
    }

    #[test]
    fn test_non_nullable_cycle_is_rejected() {
        let err = sort_tables(&[&TEAMS, &EGG, &CHICKEN]).unwrap_err();
        match err {
            Error::CyclicDependency(e) => {
                assert_eq!(e.tables, vec!["egg", "chicken", "egg"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_manual_dependencies() {
        let mut sorter = DependencySorter::new();
        assert!(sorter.add_table(&USERS));
        assert!(sorter.add_table(&TEAMS));
        assert!(!sorter.add_table(&TEAMS));
        sorter.add_dependency("teams", "users", false);
        sorter.add_dependency("users", "users", false);
        assert_eq!(sorter.len(), 2);
        assert_eq!(names(&sorter.sort().unwrap()), vec!["users", "teams"]);
    }
}
