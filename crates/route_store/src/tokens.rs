//! Invariant filter token sets and shard coverage planning.
//!
//! A request (or a stored shard) is described by a "box": for each invariant
//! parameter, the set of values it is restricted to. A parameter missing
//! from the box is unconstrained, so the empty box is the superset that
//! holds every value of every invariant parameter.
//!
//! A request box is covered by stored shards when every cell of the request
//! (one value per constrained parameter) lies inside at least one live shard
//! box. Each cell is served by exactly one shard so overlapping shards never
//! contribute duplicate rows.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Upper bound on the number of request cells the coverage planner enumerates.
///
/// Requests with a larger cross product are answered as a miss rather than
/// risking an expensive or incomplete plan.
pub const MAX_COVERAGE_CELLS: usize = 4096;

/// Canonical form of one invariant value as stored in tokens and compared against rows.
pub fn normalize_token(raw: &str, case_insensitive: bool) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if case_insensitive {
        Some(trimmed.to_lowercase())
    } else {
        Some(trimmed.to_string())
    }
}

/// Maps an invariant parameter onto the result column its values filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantColumn {
    /// Parameter name carrying the requested values.
    pub param: String,
    /// Result column compared against the values.
    pub column: String,
    /// Whether values and column contents are lower-cased before comparison.
    #[serde(default)]
    pub case_insensitive: bool,
}

/// Per-parameter invariant value sets; a parameter absent from the map is unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvariantTokens(BTreeMap<String, BTreeSet<String>>);

impl InvariantTokens {
    /// Creates an unconstrained token set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `param` to `values`. An empty value set leaves the parameter unconstrained.
    pub fn insert<I, S>(&mut self, param: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        let param = param.into();
        if values.is_empty() {
            self.0.remove(&param);
        } else {
            self.0.insert(param, values);
        }
    }

    /// Builder-style variant of [`InvariantTokens::insert`].
    pub fn with<I, S>(mut self, param: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(param, values);
        self
    }

    /// Returns `true` when no parameter is constrained (the superset box).
    pub fn is_unconstrained(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value set for one parameter, if constrained.
    pub fn get(&self, param: &str) -> Option<&BTreeSet<String>> {
        self.0.get(param)
    }

    /// Iterates constrained parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    /// Flattens the box into ordered `param=value` tokens.
    pub fn flatten(&self) -> BTreeSet<String> {
        self.0
            .iter()
            .flat_map(|(param, values)| values.iter().map(move |value| format!("{param}={value}")))
            .collect()
    }

    /// Number of cells in the box, saturating on overflow.
    pub fn cell_count(&self) -> usize {
        self.0
            .values()
            .fold(1usize, |acc, values| acc.saturating_mul(values.len()))
    }

    /// Enumerates every cell of the box in deterministic order.
    ///
    /// Cells list one value per constrained parameter, in parameter-name
    /// order. The unconstrained box has exactly one (empty) cell.
    pub fn cells(&self) -> Vec<Vec<String>> {
        let mut cells: Vec<Vec<String>> = vec![Vec::new()];
        for values in self.0.values() {
            let mut next = Vec::with_capacity(cells.len().saturating_mul(values.len()));
            for prefix in &cells {
                for value in values {
                    let mut cell = prefix.clone();
                    cell.push(value.clone());
                    next.push(cell);
                }
            }
            cells = next;
        }
        cells
    }

    /// Returns whether this box contains the given cell of `request`.
    ///
    /// A shard constraint on a parameter the request leaves open can never
    /// contain the request's cells: the request wants all values.
    pub fn contains_cell(&self, request: &InvariantTokens, cell: &[String]) -> bool {
        self.0.iter().all(|(param, allowed)| {
            request
                .0
                .keys()
                .position(|name| name == param)
                .and_then(|idx| cell.get(idx))
                .is_some_and(|value| allowed.contains(value))
        })
    }
}

impl fmt::Display for InvariantTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unconstrained() {
            return f.write_str("*");
        }
        let tokens = self.flatten().into_iter().collect::<Vec<_>>();
        f.write_str(&tokens.join(","))
    }
}

/// How a covered request is served from stored page sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CoveragePlan {
    /// One stored box equals the request exactly; its rows are served as-is.
    Exact(usize),
    /// An unconstrained stored box answers the request; rows are filtered to the request box.
    Superset(usize),
    /// Cells assigned per stored box; rows are filtered to the assigned cells.
    Assigned(Vec<(usize, BTreeSet<Vec<String>>)>),
}

/// Outcome of coverage planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CoverageDecision {
    Covered(CoveragePlan),
    Uncovered,
    TooManyCells,
}

/// Plans how `request` can be served from `stored` boxes.
///
/// Never returns a partial plan: if any cell is left uncovered the whole
/// request is uncovered. A live superset answers any request without
/// enumerating its cells, so the cell cap only applies to shard plans.
pub(crate) fn plan_coverage(
    request: &InvariantTokens,
    stored: &[&InvariantTokens],
) -> CoverageDecision {
    if let Some(idx) = stored.iter().position(|candidate| *candidate == request) {
        return CoverageDecision::Covered(CoveragePlan::Exact(idx));
    }
    if let Some(idx) = stored.iter().position(|candidate| candidate.is_unconstrained()) {
        return CoverageDecision::Covered(CoveragePlan::Superset(idx));
    }
    if request.cell_count() > MAX_COVERAGE_CELLS {
        return CoverageDecision::TooManyCells;
    }

    let cells = request.cells();
    // Prefer boxes that cover more of the request so fewer page sets are read.
    let mut ranked = stored
        .iter()
        .enumerate()
        .map(|(idx, candidate)| {
            let covered = cells
                .iter()
                .filter(|cell| candidate.contains_cell(request, cell))
                .count();
            (idx, covered)
        })
        .filter(|(_, covered)| *covered > 0)
        .collect::<Vec<_>>();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));

    let mut assigned: BTreeMap<usize, BTreeSet<Vec<String>>> = BTreeMap::new();
    for cell in cells {
        let Some((idx, _)) = ranked
            .iter()
            .find(|(idx, _)| stored[*idx].contains_cell(request, &cell))
        else {
            return CoverageDecision::Uncovered;
        };
        assigned.entry(*idx).or_default().insert(cell);
    }
    CoverageDecision::Covered(CoveragePlan::Assigned(assigned.into_iter().collect()))
}
