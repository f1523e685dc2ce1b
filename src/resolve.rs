// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package selection over the universe.

Given seed relations and an exclusion list, the resolver picks a closed,
satisfiable subset of the universe: exactly one version per package name,
with every `Depends` and `Pre-Depends` relation of every selected package
satisfied by the selection.

The solver walks relations in FIFO order, assigning the highest-ranked
candidate at each step, and backtracks through recorded choice points when
a relation cannot be satisfied or a `Conflicts`/`Breaks` clash emerges.
Output order is fully deterministic.
*/

use {
    crate::{
        database::PackageDB,
        dependency::{Alternatives, Dependency, VersionConstraint},
        error::{BuildError, Result},
        package::Package,
        version::PackageVersion,
    },
    std::collections::{BTreeMap, BTreeSet, VecDeque},
    tracing::warn,
};

/// Upper bound on solver assignments + backtracks. The selection problems
/// this tool sees are tiny; hitting the bound means an unsatisfiable or
/// pathological universe.
const MAX_SOLVER_STEPS: usize = 100_000;

/// Result of a successful resolution.
#[derive(Clone, Debug)]
pub struct Selection {
    /// The selected packages. Exactly one version per name.
    pub db: PackageDB,

    /// Package names in selection order. Layer order follows this.
    pub install_order: Vec<String>,

    /// Package names in `Pre-Depends`-respecting configure order.
    pub configure_order: Vec<String>,
}

/// Parse a seed from the recipe `include` list.
///
/// Accepted forms: `name`, `name=version`, and full relation syntax such as
/// `name (>= version)`.
pub fn parse_seed(s: &str) -> Result<Alternatives> {
    let s = s.trim();

    if s.contains('(') {
        return Ok(Alternatives::single(Dependency::parse(s)?));
    }

    if let Some((name, version)) = s.split_once('=') {
        return Ok(Alternatives::single(Dependency {
            name: name.trim().to_string(),
            architecture: None,
            constraint: Some((
                VersionConstraint::ExactlyEqual,
                PackageVersion::parse(version.trim())?,
            )),
        }));
    }

    Ok(Alternatives::single(Dependency::parse(s)?))
}

/// An exclusion pattern: `name` or `name=version`.
#[derive(Clone, Debug)]
struct Exclusion {
    name: String,
    version: Option<String>,
}

impl Exclusion {
    fn parse(s: &str) -> Self {
        match s.split_once('=') {
            Some((name, version)) => Self {
                name: name.trim().to_string(),
                version: Some(version.trim().to_string()),
            },
            None => Self {
                name: s.trim().to_string(),
                version: None,
            },
        }
    }

    fn matches(&self, pkg: &Package) -> bool {
        self.name == pkg.name()
            && match &self.version {
                Some(version) => pkg.version().to_string() == *version,
                None => true,
            }
    }
}

/// A relation queued for satisfaction, with the path that introduced it.
#[derive(Clone, Debug)]
struct QueuedRelation {
    relation: Alternatives,
    /// Names from seed to the package that required this relation.
    chain: Vec<String>,
}

impl QueuedRelation {
    fn chain_display(&self) -> String {
        let mut parts = self.chain.clone();
        parts.push(self.relation.to_string());
        parts.join(" -> ")
    }
}

/// A recorded choice point for backtracking.
struct ChoicePoint {
    queue: VecDeque<QueuedRelation>,
    selected: BTreeMap<String, Package>,
    order: Vec<String>,
    relation: QueuedRelation,
    remaining: Vec<Package>,
}

struct Solver<'u> {
    universe: &'u PackageDB,
    architecture: String,
    exclusions: Vec<Exclusion>,

    queue: VecDeque<QueuedRelation>,
    selected: BTreeMap<String, Package>,
    order: Vec<String>,
    choice_points: Vec<ChoicePoint>,
    steps: usize,
}

impl<'u> Solver<'u> {
    /// Whether a relation is already satisfied by the current selection.
    fn is_satisfied(&self, relation: &Alternatives) -> bool {
        relation.iter().any(|atom| {
            if let Some(selected) = self.selected.get(&atom.name) {
                if atom.satisfied_by(selected.name(), selected.version()) {
                    return true;
                }
            }

            self.selected.values().any(|pkg| {
                pkg.provides().iter().any(|provided| {
                    provided.name == atom.name
                        && match (&atom.constraint, &provided.version) {
                            (None, _) => true,
                            (Some((op, wanted)), Some(version)) => op.satisfied_by(version, wanted),
                            (Some(_), None) => false,
                        }
                })
            })
        })
    }

    /// Whether selecting `candidate` clashes with the current selection.
    fn conflicts_with_selection(&self, candidate: &Package) -> bool {
        let against = |owner: &Package, other: &Package| {
            owner
                .conflicts()
                .iter_atoms()
                .chain(owner.breaks().iter_atoms())
                .any(|atom| {
                    atom.satisfied_by(other.name(), other.version())
                        || other.provides().iter().any(|provided| {
                            atom.satisfied_by_virtual(&provided.name)
                        })
                })
        };

        self.selected
            .values()
            .any(|selected| against(candidate, selected) || against(selected, candidate))
    }

    /// Rank candidates for a relation.
    ///
    /// Alternatives are honored in listed order. For each atom, real
    /// packages satisfying the constraint come first (highest version
    /// wins); providers are considered only when no real package
    /// satisfies, tie-broken by name ascending. Excluded and clashing
    /// candidates are removed.
    ///
    /// The second return value reports whether the exclusion list removed
    /// at least one otherwise-viable candidate.
    fn rank_candidates(&self, relation: &Alternatives) -> (Vec<Package>, bool) {
        let mut out: Vec<Package> = Vec::new();
        let mut seen = BTreeSet::new();
        let mut saw_excluded = false;

        let push = |pkg: &Package, seen: &mut BTreeSet<(String, String)>, saw_excluded: &mut bool, out: &mut Vec<Package>| {
            let key = (pkg.name().to_string(), pkg.version().to_string());
            if seen.contains(&key) {
                return;
            }
            seen.insert(key);

            if self.exclusions.iter().any(|e| e.matches(pkg)) {
                *saw_excluded = true;
                return;
            }

            // A different version of an already-selected name cannot join
            // the selection.
            if let Some(selected) = self.selected.get(pkg.name()) {
                if selected.version() != pkg.version() {
                    return;
                }
            }

            if self.conflicts_with_selection(pkg) {
                return;
            }

            out.push(pkg.clone());
        };

        for atom in relation.iter() {
            let reals = self
                .universe
                .find_by_name(&atom.name, Some(&self.architecture))
                .into_iter()
                .filter(|pkg| atom.satisfied_by(pkg.name(), pkg.version()))
                .collect::<Vec<_>>();

            if !reals.is_empty() {
                for pkg in reals {
                    push(pkg, &mut seen, &mut saw_excluded, &mut out);
                }
                continue;
            }

            let mut providers = self
                .universe
                .find_providers(&atom.name, Some(&self.architecture))
                .into_iter()
                .filter(|pkg| {
                    pkg.provides().iter().any(|provided| {
                        provided.name == atom.name
                            && match (&atom.constraint, &provided.version) {
                                (None, _) => true,
                                (Some((op, wanted)), Some(version)) => {
                                    op.satisfied_by(version, wanted)
                                }
                                (Some(_), None) => false,
                            }
                    })
                })
                .collect::<Vec<_>>();
            providers.sort_by(|a, b| a.name().cmp(b.name()));

            for pkg in providers {
                push(pkg, &mut seen, &mut saw_excluded, &mut out);
            }
        }

        (out, saw_excluded)
    }

    /// Select a package: record it and enqueue its hard dependencies.
    ///
    /// `Pre-Depends` selects identically to `Depends`; its ordering
    /// semantics only matter when computing the configure order.
    fn select(&mut self, pkg: Package, chain: &[String]) {
        let mut child_chain = chain.to_vec();
        child_chain.push(pkg.name().to_string());

        for relation in pkg.depends().iter().chain(pkg.pre_depends().iter()) {
            self.queue.push_back(QueuedRelation {
                relation: relation.clone(),
                chain: child_chain.clone(),
            });
        }

        self.order.push(pkg.name().to_string());
        self.selected.insert(pkg.name().to_string(), pkg);
    }

    /// Restore the most recent choice point with untried candidates.
    ///
    /// Choice points pinned on essential packages are never recorded, so
    /// essential selections are not undone here.
    fn backtrack(&mut self) -> bool {
        while let Some(mut point) = self.choice_points.pop() {
            let candidate = match point.remaining.first() {
                Some(_) => point.remaining.remove(0),
                None => continue,
            };

            self.queue = point.queue.clone();
            self.selected = point.selected.clone();
            self.order = point.order.clone();

            let chain = point.relation.chain.clone();

            if !point.remaining.is_empty() {
                self.choice_points.push(point);
            }

            self.select(candidate, &chain);

            return true;
        }

        false
    }

    fn run(mut self) -> Result<(BTreeMap<String, Package>, Vec<String>)> {
        while let Some(queued) = self.queue.pop_front() {
            self.steps += 1;
            if self.steps > MAX_SOLVER_STEPS {
                return Err(BuildError::Unsatisfiable {
                    relation: queued.relation.to_string(),
                    chain: queued.chain_display(),
                });
            }

            if self.is_satisfied(&queued.relation) {
                continue;
            }

            let (mut candidates, saw_excluded) = self.rank_candidates(&queued.relation);

            if candidates.is_empty() {
                // A seed whose only candidates were excluded is a direct
                // user error rather than a search failure.
                if queued.chain.is_empty() && saw_excluded {
                    return Err(BuildError::Excluded(queued.relation.to_string()));
                }

                if self.backtrack() {
                    continue;
                }

                return Err(BuildError::Unsatisfiable {
                    relation: queued.relation.to_string(),
                    chain: queued.chain_display(),
                });
            }

            let pick = candidates.remove(0);

            if !candidates.is_empty() && !pick.is_essential() {
                self.choice_points.push(ChoicePoint {
                    queue: self.queue.clone(),
                    selected: self.selected.clone(),
                    order: self.order.clone(),
                    relation: queued.clone(),
                    remaining: candidates,
                });
            }

            self.select(pick, &queued.chain);
        }

        Ok((self.selected, self.order))
    }
}

/// Resolve a selection from seeds and exclusions.
///
/// `include` entries use [parse_seed] syntax. `exclude` entries are `name`
/// or `name=version` patterns.
pub fn resolve(
    universe: &PackageDB,
    architecture: &str,
    include: &[String],
    exclude: &[String],
) -> Result<Selection> {
    let mut queue = VecDeque::new();

    for seed in include {
        queue.push_back(QueuedRelation {
            relation: parse_seed(seed)?,
            chain: Vec::new(),
        });
    }

    let solver = Solver {
        universe,
        architecture: architecture.to_string(),
        exclusions: exclude.iter().map(|s| Exclusion::parse(s)).collect(),
        queue,
        selected: BTreeMap::new(),
        order: Vec::new(),
        choice_points: Vec::new(),
        steps: 0,
    };

    let (selected, install_order) = solver.run()?;

    let mut db = PackageDB::new();
    for pkg in selected.values() {
        db.add(pkg.clone())?;
    }

    let configure_order = configure_order(&selected, &install_order);

    Ok(Selection {
        db,
        install_order,
        configure_order,
    })
}

/// Topologically order selected packages so that every `Pre-Depends`
/// provider configures before its dependents. Cycles are reported as a
/// warning and fall back to selection order.
fn configure_order(
    selected: &BTreeMap<String, Package>,
    install_order: &[String],
) -> Vec<String> {
    // name -> names that must configure before it.
    let mut blockers: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for (name, pkg) in selected {
        let entry = blockers.entry(name.as_str()).or_default();

        for atom in pkg.pre_depends().iter_atoms() {
            if let Some(provider) = selected.get(&atom.name) {
                if provider.name() != name {
                    entry.insert(provider.name());
                }
            } else {
                // Satisfied via Provides; find the provider.
                for candidate in selected.values() {
                    if candidate.name() != name
                        && candidate
                            .provides()
                            .iter()
                            .any(|p| p.name == atom.name)
                    {
                        entry.insert(candidate.name());
                    }
                }
            }
        }
    }

    let mut order = Vec::with_capacity(selected.len());
    let mut placed: BTreeSet<&str> = BTreeSet::new();

    loop {
        let ready = blockers
            .iter()
            .filter(|(name, deps)| {
                !placed.contains(*name) && deps.iter().all(|d| placed.contains(d))
            })
            .map(|(name, _)| *name)
            .collect::<Vec<_>>();

        if ready.is_empty() {
            break;
        }

        for name in ready {
            placed.insert(name);
            order.push(name.to_string());
        }
    }

    if placed.len() != selected.len() {
        let cyclic = selected
            .keys()
            .filter(|name| !placed.contains(name.as_str()))
            .cloned()
            .collect::<Vec<_>>();

        warn!(
            packages = %cyclic.join(", "),
            "Pre-Depends cycle detected; falling back to selection order"
        );

        for name in install_order {
            if !placed.contains(name.as_str()) {
                order.push(name.clone());
            }
        }
    }

    order
}
