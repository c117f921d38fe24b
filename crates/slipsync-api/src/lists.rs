//! Windowed room list projection
//!
//! Sorting, filtering and the SYNC / INSERT / DELETE / INVALIDATE op
//! calculus clients use to maintain their local copy of each list. The
//! conn holds one ListState per named list and diffs the windowed slices
//! against what it last emitted.

use std::collections::BTreeSet;

use crate::cache::RoomMetadata;
use crate::types::{ListFilters, ListOp, ListRequest, RoomSubscription};

/// A room as the sorter sees it
#[derive(Debug, Clone)]
pub struct SortableRoom {
    pub room_id: String,
    pub display_name: String,
    pub last_message_ts: i64,
    pub encrypted: bool,
    pub is_invite: bool,
    pub room_type: Option<String>,
}

impl SortableRoom {
    pub fn from_metadata(metadata: &RoomMetadata, me: &str) -> Self {
        Self {
            room_id: metadata.room_id.clone(),
            display_name: metadata
                .display_name(me)
                .unwrap_or_else(|| metadata.room_id.clone()),
            last_message_ts: metadata.last_message_ts,
            encrypted: metadata.encrypted,
            is_invite: false,
            room_type: metadata.room_type.clone(),
        }
    }
}

/// Sticky per-list session state
#[derive(Debug, Clone, Default)]
pub struct ListState {
    /// Requested index windows
    pub ranges: Vec<(u64, u64)>,

    /// Sort orders, first applicable wins
    pub sort: Vec<String>,

    /// Room filters
    pub filters: Option<ListFilters>,

    /// Room payload template
    pub room_details: RoomSubscription,

    /// The full sorted order emitted last time
    pub prev_order: Vec<String>,

    /// Ranges emitted last time, for INVALIDATE on change
    pub prev_ranges: Vec<(u64, u64)>,

    /// Whether the windows have been SYNCed at least once; an unprimed
    /// list always re-SYNCs (a zero-room list primes too, so idle conns
    /// do not spin)
    pub primed: bool,
}

impl ListState {
    /// Fold a request's (sticky) list params into the session state.
    /// Returns true when ranges, sort or filters changed, which forces a
    /// full re-SYNC of the windows.
    pub fn merge_request(&mut self, req: &ListRequest) -> bool {
        let mut invalidated = false;
        if !req.ranges.is_empty() && req.ranges != self.ranges {
            invalidated = true;
            self.prev_ranges = std::mem::replace(&mut self.ranges, req.ranges.clone());
        }
        if let Some(sort) = &req.sort {
            if *sort != self.sort {
                invalidated = true;
                self.sort = sort.clone();
            }
        }
        if let Some(filters) = &req.filters {
            // Filters are compared structurally via their JSON projection
            let changed = self
                .filters
                .as_ref()
                .map(|old| !filters_eq(old, filters))
                .unwrap_or(true);
            if changed {
                invalidated = true;
                self.filters = Some(filters.clone());
            }
        }
        if !req.room_details.required_state.is_empty() {
            self.room_details.required_state = req.room_details.required_state.clone();
        }
        if let Some(limit) = req.room_details.timeline_limit {
            self.room_details.timeline_limit = Some(limit);
        }
        invalidated
    }
}

fn filters_eq(a: &ListFilters, b: &ListFilters) -> bool {
    a.is_encrypted == b.is_encrypted
        && a.is_invite == b.is_invite
        && a.room_types == b.room_types
        && a.spaces == b.spaces
}

/// Whether a room passes a list's filters
pub fn passes_filters(
    room: &SortableRoom,
    filters: Option<&ListFilters>,
    space_children: &BTreeSet<String>,
) -> bool {
    let Some(filters) = filters else { return true };
    if let Some(want_encrypted) = filters.is_encrypted {
        if room.encrypted != want_encrypted {
            return false;
        }
    }
    if let Some(want_invite) = filters.is_invite {
        if room.is_invite != want_invite {
            return false;
        }
    }
    if let Some(room_types) = &filters.room_types {
        if !room_types.iter().any(|t| *t == room.room_type) {
            return false;
        }
    }
    if filters.spaces.is_some() && !space_children.contains(&room.room_id) {
        return false;
    }
    true
}

/// Sort rooms by the list's sort orders. by_recency is newest first;
/// by_name is lexicographic on the display name. Room id breaks ties so
/// the order is total and stable across requests.
pub fn sort_rooms(rooms: &mut [SortableRoom], sort: &[String]) {
    let orders: Vec<&str> = if sort.is_empty() {
        vec!["by_recency"]
    } else {
        sort.iter().map(String::as_str).collect()
    };
    rooms.sort_by(|a, b| {
        for order in &orders {
            let ordering = match *order {
                "by_recency" => b.last_message_ts.cmp(&a.last_message_ts),
                "by_name" => a.display_name.cmp(&b.display_name),
                _ => std::cmp::Ordering::Equal,
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        a.room_id.cmp(&b.room_id)
    });
}

/// Clamp a range to the list length and slice the order
pub fn window<'a>(order: &'a [String], range: (u64, u64)) -> &'a [String] {
    let lo = range.0 as usize;
    let hi = (range.1 as usize).saturating_add(1).min(order.len());
    if lo >= order.len() {
        return &[];
    }
    &order[lo..hi]
}

/// Compute the ops for one list.
///
/// A fresh list or an invalidated one re-SYNCs every range (after
/// INVALIDATE for ranges no longer requested). Otherwise each range is
/// diffed against the previous emission: an unchanged window emits
/// nothing, a single moved or swapped room emits a DELETE / INSERT pair,
/// anything bigger re-SYNCs the range.
pub fn compute_ops(state: &mut ListState, new_order: &[String], invalidated: bool) -> Vec<ListOp> {
    let mut ops = Vec::new();
    let first_emission = !state.primed && !state.ranges.is_empty();

    if invalidated || first_emission {
        for range in std::mem::take(&mut state.prev_ranges) {
            if !state.ranges.contains(&range) {
                ops.push(ListOp::Invalidate { range });
            }
        }
        for range in &state.ranges {
            let room_ids = window(new_order, *range).to_vec();
            ops.push(ListOp::Sync {
                range: *range,
                room_ids,
            });
        }
    } else {
        for range in &state.ranges {
            let prev = window(&state.prev_order, *range);
            let next = window(new_order, *range);
            ops.extend(diff_window(prev, next, *range));
        }
    }

    state.primed = true;
    state.prev_order = new_order.to_vec();
    ops
}

/// Diff one window of the list. See compute_ops for the contract.
fn diff_window(prev: &[String], next: &[String], range: (u64, u64)) -> Vec<ListOp> {
    if prev == next {
        return Vec::new();
    }
    let resync = vec![ListOp::Sync {
        range,
        room_ids: next.to_vec(),
    }];
    if prev.len() != next.len() {
        return resync;
    }

    let prev_set: BTreeSet<&String> = prev.iter().collect();
    let next_set: BTreeSet<&String> = next.iter().collect();
    let gone: Vec<&&String> = prev_set.difference(&next_set).collect();
    let came: Vec<&&String> = next_set.difference(&prev_set).collect();

    let (delete_room, insert_room) = match (gone.len(), came.len()) {
        // A room moved within the window
        (0, 0) => {
            // The moved room is the one whose removal re-aligns the rest
            let Some(candidate) = prev
                .iter()
                .find(|room| {
                    let trimmed_prev: Vec<&String> = prev.iter().filter(|r| r != room).collect();
                    let trimmed_next: Vec<&String> = next.iter().filter(|r| r != room).collect();
                    trimmed_prev == trimmed_next
                })
            else {
                return resync;
            };
            (candidate.clone(), candidate.clone())
        }
        // One room left the window, another entered
        (1, 1) => ((**gone[0]).clone(), (**came[0]).clone()),
        _ => return resync,
    };

    let delete_index = prev.iter().position(|r| *r == delete_room);
    let insert_index = next.iter().position(|r| *r == insert_room);
    match (delete_index, insert_index) {
        (Some(di), Some(ii)) => {
            // Verify the pair actually explains the change
            let mut trial: Vec<String> = prev.to_vec();
            trial.remove(di);
            trial.insert(ii, insert_room.clone());
            if trial != next {
                return resync;
            }
            vec![
                ListOp::Delete {
                    index: range.0 + di as u64,
                },
                ListOp::Insert {
                    index: range.0 + ii as u64,
                    room_id: insert_room,
                },
            ]
        }
        _ => resync,
    }
}
