//! Grid of candidate buckets covering an image.
//!
//! Each cell of the grid keeps its candidates in a min-heap keyed by rank, so
//! a full cell can drop its faintest member in `O(log n)` when a brighter star
//! arrives. Candidates live in an arena indexed by [`CandidateId`]; evicted
//! candidates leave an empty slot and their id is never reused.
//!
//! Iteration order is bucket-major: cells row by row, and inside a cell by
//! rank descending with ties broken by ascending id. Every fit and rejection
//! pass walks candidates in this order, which keeps runs deterministic.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use shared::{BoundingBox, MaskedImage};

use crate::candidate::{Candidate, CandidateId, CandidateStatus};
use crate::error::PsfError;

/// Heap key of one candidate inside its cell
#[derive(Debug, Clone, Copy)]
struct RankKey {
    rank: f64,
    id: CandidateId,
}

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankKey {}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankKey {
    /// Higher rank is greater; on equal rank the older candidate is greater
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .total_cmp(&other.rank)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Result of [`CandidateRegistry::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored without displacing anyone
    Inserted(CandidateId),
    /// Stored after evicting the lowest-ranked member of a full cell
    Evicted {
        inserted: CandidateId,
        evicted: CandidateId,
    },
    /// The cell was full of higher-ranked candidates
    Dropped,
}

#[derive(Debug, Clone)]
pub struct CandidateRegistry {
    bbox: BoundingBox,
    cell_width: usize,
    cell_height: usize,
    n_cells_x: usize,
    n_cells_y: usize,
    capacity: usize,
    candidates: Vec<Option<Candidate>>,
    cells: Vec<BinaryHeap<Reverse<RankKey>>>,
}

impl CandidateRegistry {
    /// Cover `bbox` with cells of `cell_width x cell_height` pixels, each
    /// holding at most `capacity` candidates (0 = unbounded).
    pub fn new(
        bbox: BoundingBox,
        cell_width: usize,
        cell_height: usize,
        capacity: usize,
    ) -> Result<Self, PsfError> {
        if cell_width == 0 || cell_height == 0 {
            return Err(PsfError::Config(format!(
                "cell size must be positive, got {cell_width}x{cell_height}"
            )));
        }
        if bbox.width == 0 || bbox.height == 0 {
            return Err(PsfError::Input("image bounding box is empty".to_string()));
        }
        let n_cells_x = bbox.width.div_ceil(cell_width);
        let n_cells_y = bbox.height.div_ceil(cell_height);
        Ok(Self {
            bbox,
            cell_width,
            cell_height,
            n_cells_x,
            n_cells_y,
            capacity,
            candidates: Vec::new(),
            cells: vec![BinaryHeap::new(); n_cells_x * n_cells_y],
        })
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Number of grid cells along x and y
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.n_cells_x, self.n_cells_y)
    }

    fn cell_index(&self, x: f64, y: f64) -> Option<usize> {
        let (col, row) = self.bbox.pixel_index(x, y)?;
        Some((row / self.cell_height) * self.n_cells_x + col / self.cell_width)
    }

    /// Add a candidate to the cell covering its position.
    ///
    /// A full cell keeps its top `capacity` candidates by rank; the loser is
    /// either an existing member (evicted) or the newcomer (dropped).
    pub fn insert(&mut self, mut candidate: Candidate) -> Result<InsertOutcome, PsfError> {
        let cell = self.cell_index(candidate.x(), candidate.y()).ok_or_else(|| {
            PsfError::Input(format!(
                "candidate at ({:.2}, {:.2}) lies outside the image {:?}",
                candidate.x(),
                candidate.y(),
                self.bbox
            ))
        })?;

        let id = self.candidates.len();
        let key = RankKey {
            rank: candidate.rank(),
            id,
        };

        let mut evicted = None;
        if self.capacity > 0 && self.cells[cell].len() >= self.capacity {
            let lowest = self.cells[cell].peek().map(|Reverse(k)| *k);
            match lowest {
                Some(lowest) if lowest < key => {
                    self.cells[cell].pop();
                    self.candidates[lowest.id] = None;
                    evicted = Some(lowest.id);
                }
                _ => return Ok(InsertOutcome::Dropped),
            }
        }

        candidate.set_id(id);
        self.candidates.push(Some(candidate));
        self.cells[cell].push(Reverse(key));

        Ok(match evicted {
            Some(evicted) => InsertOutcome::Evicted {
                inserted: id,
                evicted,
            },
            None => InsertOutcome::Inserted(id),
        })
    }

    /// Ids of one cell, best first
    fn cell_ids(&self, cell: usize) -> Vec<CandidateId> {
        let mut keys: Vec<RankKey> = self.cells[cell].iter().map(|Reverse(k)| *k).collect();
        keys.sort_by(|a, b| b.cmp(a));
        keys.into_iter().map(|k| k.id).collect()
    }

    fn select_per_cell<F>(&self, limit: usize, keep: F) -> Vec<CandidateId>
    where
        F: Fn(&Candidate) -> bool,
    {
        let mut ids = Vec::new();
        for cell in 0..self.cells.len() {
            let selected = self
                .cell_ids(cell)
                .into_iter()
                .filter(|&id| self.get(id).is_some_and(&keep));
            if limit == 0 {
                ids.extend(selected);
            } else {
                ids.extend(selected.take(limit));
            }
        }
        ids
    }

    /// All candidate ids in bucket-major order, BAD ones only if `include_bad`
    pub fn ids(&self, include_bad: bool) -> Vec<CandidateId> {
        self.candidates_per_cell(0, include_bad)
    }

    /// The first `limit` candidates of every cell (0 = all of them)
    pub fn candidates_per_cell(&self, limit: usize, include_bad: bool) -> Vec<CandidateId> {
        self.select_per_cell(limit, |c| include_bad || !c.is_bad())
    }

    /// The first `limit` fit-ready candidates of every cell: not BAD and
    /// carrying a stamp
    pub fn usable_per_cell(&self, limit: usize) -> Vec<CandidateId> {
        self.select_per_cell(limit, |c| !c.is_bad() && c.has_stamp())
    }

    /// Visit candidates in bucket-major order
    pub fn for_each_candidate<F>(&self, include_bad: bool, mut f: F)
    where
        F: FnMut(&Candidate),
    {
        for id in self.ids(include_bad) {
            if let Some(candidate) = self.get(id) {
                f(candidate);
            }
        }
    }

    pub fn iter(&self, include_bad: bool) -> impl Iterator<Item = &Candidate> + '_ {
        self.ids(include_bad)
            .into_iter()
            .filter_map(move |id| self.get(id))
    }

    pub fn get(&self, id: CandidateId) -> Option<&Candidate> {
        self.candidates.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: CandidateId) -> Option<&mut Candidate> {
        self.candidates.get_mut(id).and_then(Option::as_mut)
    }

    /// Number of candidates held across all cells
    pub fn len(&self) -> usize {
        self.cells.iter().map(BinaryHeap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of candidates, BAD ones only if `include_bad`
    pub fn count(&self, include_bad: bool) -> usize {
        self.candidates
            .iter()
            .flatten()
            .filter(|c| include_bad || !c.is_bad())
            .count()
    }

    pub fn set_status(&mut self, id: CandidateId, status: CandidateStatus) -> Result<(), PsfError> {
        let candidate = self
            .get_mut(id)
            .ok_or_else(|| PsfError::Input(format!("no candidate with id {id}")))?;
        candidate.set_status(status);
        Ok(())
    }

    /// Put every candidate back to UNKNOWN
    pub fn reset_statuses(&mut self) {
        for candidate in self.candidates.iter_mut().flatten() {
            candidate.set_status(CandidateStatus::Unknown);
        }
    }

    /// Cut a `size x size` stamp for every candidate.
    ///
    /// Candidates too close to the image edge are left without a stamp.
    /// Returns the ids of those candidates.
    pub fn extract_stamps(&mut self, image: &MaskedImage, size: usize) -> Vec<CandidateId> {
        let mut missing = Vec::new();
        for candidate in self.candidates.iter_mut().flatten() {
            let stamp = image.cutout(candidate.x(), candidate.y(), size).ok();
            if stamp.is_none() {
                missing.push(candidate.id());
            }
            candidate.set_stamp(stamp);
        }
        missing
    }

    pub(crate) fn candidates_mut(&mut self) -> impl Iterator<Item = &mut Candidate> {
        self.candidates.iter_mut().flatten()
    }
}
