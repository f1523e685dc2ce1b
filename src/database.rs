// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The in-memory package universe.

[PackageDB] indexes parsed packages by `(name, architecture, version)` and
maintains a secondary index over virtual `Provides` names. Iteration order
is fully deterministic: names ascending, architectures ascending, versions
descending.
*/

use {
    crate::{
        error::Result,
        package::Package,
    },
    std::collections::BTreeMap,
};

/// Indexed collection of packages with source-merge semantics.
#[derive(Clone, Debug, Default)]
pub struct PackageDB {
    /// `(name, arch)` to packages of that name/arch, versions descending.
    packages: BTreeMap<(String, String), Vec<Package>>,

    /// Virtual name to `(name, arch)` keys of providers.
    providers: BTreeMap<String, Vec<(String, String)>>,

    len: usize,
}

impl PackageDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one package.
    ///
    /// Two packages with equal `(name, arch, version)` must carry the same
    /// SHA-256; their URL lists are unioned. Differing digests are fatal.
    pub fn add(&mut self, pkg: Package) -> Result<()> {
        let key = (pkg.name().to_string(), pkg.architecture().to_string());

        let entries = self.packages.entry(key.clone()).or_default();

        if let Some(existing) = entries.iter_mut().find(|p| p.version() == pkg.version()) {
            return existing.merge_urls(&pkg);
        }

        for provided in pkg.provides() {
            let keys = self.providers.entry(provided.name.clone()).or_default();
            if !keys.contains(&key) {
                keys.push(key.clone());
                keys.sort();
            }
        }

        // Highest version first.
        let pos = entries
            .iter()
            .position(|p| p.version() < pkg.version())
            .unwrap_or(entries.len());
        entries.insert(pos, pkg);

        self.len += 1;

        Ok(())
    }

    /// Bulk add. Either every package is added or the database is unchanged.
    pub fn add_all(&mut self, packages: impl IntoIterator<Item = Package>) -> Result<()> {
        let mut staged = self.clone();

        for pkg in packages {
            staged.add(pkg)?;
        }

        *self = staged;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All versions of a named package, descending by version.
    ///
    /// With an architecture filter, only packages of that architecture or
    /// of architecture `all` are returned.
    pub fn find_by_name(&self, name: &str, arch_filter: Option<&str>) -> Vec<&Package> {
        let mut res = self
            .packages
            .range((name.to_string(), String::new())..)
            .take_while(|((n, _), _)| n == name)
            .filter(|((_, arch), _)| match arch_filter {
                Some(wanted) => arch == wanted || arch == "all",
                None => true,
            })
            .flat_map(|(_, entries)| entries.iter())
            .collect::<Vec<_>>();

        res.sort_by(|a, b| b.version().cmp(a.version()).then_with(|| {
            a.architecture().cmp(b.architecture())
        }));

        res
    }

    /// Packages whose `Provides` list contains the virtual name, ascending
    /// by package name.
    pub fn find_providers(&self, virtual_name: &str, arch_filter: Option<&str>) -> Vec<&Package> {
        let keys = match self.providers.get(virtual_name) {
            Some(keys) => keys,
            None => return Vec::new(),
        };

        keys.iter()
            .filter(|(_, arch)| match arch_filter {
                Some(wanted) => arch == wanted || arch == "all",
                None => true,
            })
            .filter_map(|key| self.packages.get(key))
            .flat_map(|entries| entries.iter())
            .filter(|pkg| pkg.provides().iter().any(|p| p.name == virtual_name))
            .collect()
    }

    /// Stable iteration: names ascending, architectures ascending, versions
    /// descending.
    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.values().flat_map(|entries| entries.iter())
    }

    /// Visit every package in deterministic order.
    pub fn for_each<E>(&self, mut visitor: impl FnMut(&Package) -> std::result::Result<(), E>) -> std::result::Result<(), E> {
        for pkg in self.iter() {
            visitor(pkg)?;
        }

        Ok(())
    }

    /// A new database holding only packages matching the predicate.
    pub fn filter(&self, mut predicate: impl FnMut(&Package) -> bool) -> Self {
        let mut res = Self::new();

        for pkg in self.iter() {
            if predicate(pkg) {
                res.add(pkg.clone()).expect("re-adding filtered packages");
            }
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::testutil::{package, stanza};

    #[test]
    fn versions_sort_descending() {
        let mut db = PackageDB::new();
        db.add(package(&stanza("dash", "0.5.11-1", ""))).unwrap();
        db.add(package(&stanza("dash", "0.5.12-2", ""))).unwrap();
        db.add(package(&stanza("dash", "0.5.12-1", ""))).unwrap();

        let found = db.find_by_name("dash", Some("amd64"));
        let versions = found
            .iter()
            .map(|p| p.version().to_string())
            .collect::<Vec<_>>();

        assert_eq!(versions, vec!["0.5.12-2", "0.5.12-1", "0.5.11-1"]);
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn same_version_merges_urls() {
        let mut db = PackageDB::new();
        db.add(package(&stanza("dash", "0.5.12-2", ""))).unwrap();
        db.add(package(&stanza("dash", "0.5.12-2", ""))).unwrap();

        assert_eq!(db.len(), 1);
        assert_eq!(db.find_by_name("dash", None).len(), 1);
    }

    #[test]
    fn digest_conflict_is_fatal_and_bulk_add_atomic() {
        let mut db = PackageDB::new();
        db.add(package(&stanza("dash", "0.5.12-2", ""))).unwrap();

        let conflicting =
            stanza("dash", "0.5.12-2", "").replace(&"a".repeat(64), &"b".repeat(64));

        let result = db.add_all(vec![
            package(&stanza("zsh", "5.9-4", "")),
            package(&conflicting),
        ]);

        assert!(result.is_err());
        // The batch failed, so zsh must not have landed either.
        assert!(db.find_by_name("zsh", None).is_empty());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn providers_index() {
        let mut db = PackageDB::new();
        db.add(package(&stanza(
            "postfix",
            "3.7.10-0",
            "Provides: mail-transport-agent\n",
        )))
        .unwrap();
        db.add(package(&stanza(
            "exim4",
            "4.96-15",
            "Provides: mail-transport-agent\n",
        )))
        .unwrap();

        let providers = db.find_providers("mail-transport-agent", Some("amd64"));
        let names = providers.iter().map(|p| p.name()).collect::<Vec<_>>();

        // Ascending by name.
        assert_eq!(names, vec!["exim4", "postfix"]);
        assert!(db.find_providers("nonexistent", None).is_empty());
    }

    #[test]
    fn arch_filter_includes_all() {
        let mut db = PackageDB::new();
        db.add(package(
            &stanza("tzdata", "2024a-0", "").replace("Architecture: amd64", "Architecture: all"),
        ))
        .unwrap();

        assert_eq!(db.find_by_name("tzdata", Some("arm64")).len(), 1);
    }

    #[test]
    fn filter_produces_independent_db() {
        let mut db = PackageDB::new();
        db.add(package(&stanza("dash", "0.5.12-2", ""))).unwrap();
        db.add(package(&stanza("zsh", "5.9-4", ""))).unwrap();

        let filtered = db.filter(|p| p.name() == "dash");
        assert_eq!(filtered.len(), 1);
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn deterministic_iteration() {
        let mut db = PackageDB::new();
        db.add(package(&stanza("zsh", "5.9-4", ""))).unwrap();
        db.add(package(&stanza("bash", "5.2.15-2", ""))).unwrap();
        db.add(package(&stanza("dash", "0.5.12-2", ""))).unwrap();

        let names = db.iter().map(|p| p.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["bash", "dash", "zsh"]);
    }
}
