//! Priority arrays, affinity tables and device grouping
//!
//! All functions here are pure. The allocators combine them with a node's
//! free topology to find the tightest group that still fits a request.

use gangplank_core::{SchedError, SchedResult};
use std::collections::BTreeMap;

/// Whether `request` devices can be served by a two-module node
///
/// Up to one module's worth is always allowed; beyond that the request
/// must come in cross-module pairs.
pub fn is_valid_module_request(request: u32, capacity: u32) -> bool {
    let half = capacity / 2;
    request >= 1 && (request <= half || (request % 2 == 0 && request <= capacity))
}

/// Candidate group sizes for a request on a two-module node, best fit first
///
/// * a full-node request only fits a full node;
/// * up to one module: every size from the request up to a module;
/// * beyond one module: sizes in steps of two up to the full node.
pub fn module_priority_array(request: u32, capacity: u32) -> SchedResult<Vec<u32>> {
    if !is_valid_module_request(request, capacity) {
        return Err(SchedError::InvalidRequest(format!(
            "illegal request npu number: {}",
            request
        )));
    }

    let half = capacity / 2;
    if request == capacity {
        return Ok(vec![capacity]);
    }
    if request <= half {
        return Ok((request..=half).collect());
    }
    Ok((request..=capacity).step_by(2).collect())
}

/// Candidate group sizes from `request` up to `upper`, best fit first
pub fn ascending_priority(request: u32, upper: u32) -> SchedResult<Vec<u32>> {
    if request < 1 || request > upper {
        return Err(SchedError::InvalidRequest(format!(
            "illegal request npu number: {}",
            request
        )));
    }
    Ok((request..=upper).collect())
}

/// Affinity table for groups of up to `size` devices
///
/// `table[t - 1][f - 1]` is the score of serving `t` devices from a group
/// with `f` free: the number of devices left over, or `size` when the
/// group is too small. Lower is better; `size` (the table length) marks
/// an infeasible pairing.
pub fn affinity_table(size: u32) -> Vec<Vec<u32>> {
    (1..=size)
        .map(|task| {
            (1..=size)
                .map(|free| if free >= task { free - task } else { size })
                .collect()
        })
        .collect()
}

/// Look up `table` for `request` devices in a group of `free`
///
/// Out-of-range lookups score as infeasible.
pub fn affinity_score(table: &[Vec<u32>], request: usize, free: usize) -> u32 {
    let infeasible = table.len() as u32;
    if request == 0 || free == 0 {
        return infeasible;
    }
    table
        .get(request - 1)
        .and_then(|row| row.get(free - 1))
        .copied()
        .unwrap_or(infeasible)
}

/// Partition free devices into fixed-size groups by index
///
/// Device `i` lands in group `i / group_size`. Only groups holding a free
/// device are returned, in group order. A zero group size yields no groups.
pub fn group_devices(devices: &[u32], group_size: u32) -> Vec<Vec<u32>> {
    if group_size == 0 {
        return Vec::new();
    }

    let mut groups: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for device in devices {
        groups.entry(device / group_size).or_default().push(*device);
    }
    groups.into_values().collect()
}
