//! Accelerator device topology and its annotation encoding

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{SchedError, SchedResult};

/// Encodes device index sets into annotation strings and back
///
/// The device plugin on each node reads these annotations to enforce a
/// binding, so the format is `<prefix><index>` joined by commas with
/// indices in ascending order, e.g. `Ascend910-0,Ascend910-3`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCodec {
    resource_name: String,
    prefix: String,
}

impl DeviceCodec {
    /// Create a codec for a resource name and device name prefix
    pub fn new(resource_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            prefix: prefix.into(),
        }
    }

    /// Resource name, also the annotation key holding free devices
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Annotation key listing unhealthy devices
    pub fn unhealthy_key(&self) -> String {
        format!("{}-Unhealthy", self.resource_name)
    }

    /// Annotation key listing devices with a broken inter-node link
    pub fn network_unhealthy_key(&self) -> String {
        format!("{}-NetworkUnhealthy", self.resource_name)
    }

    /// Encode device indices
    pub fn encode(&self, devices: &[u32]) -> String {
        let mut sorted = devices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
            .iter()
            .map(|idx| format!("{}{}", self.prefix, idx))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Decode an annotation value; an empty value is an empty set
    pub fn decode(&self, value: &str) -> SchedResult<Vec<u32>> {
        let mut devices = BTreeSet::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let index = item
                .strip_prefix(self.prefix.as_str())
                .and_then(|idx| idx.parse::<u32>().ok())
                .ok_or_else(|| {
                    SchedError::Argument(format!(
                        "device '{}' does not match '{}<index>'",
                        item, self.prefix
                    ))
                })?;
            devices.insert(index);
        }
        Ok(devices.into_iter().collect())
    }

    /// Decode the devices stored under `key`; a missing key is an empty set
    pub fn read(&self, annotations: &BTreeMap<String, String>, key: &str) -> SchedResult<Vec<u32>> {
        match annotations.get(key) {
            Some(value) => self.decode(value),
            None => Ok(Vec::new()),
        }
    }
}

/// Free accelerator devices on one node
///
/// Devices with index below `capacity / 2` sit in the left module, the
/// rest in the right module. Devices `i` and `i + capacity / 2` are
/// physically adjacent across the module boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopology {
    devices: BTreeSet<u32>,
    capacity: u32,
}

impl DeviceTopology {
    /// Create a topology from free device indices and the node capacity
    pub fn new(devices: impl IntoIterator<Item = u32>, capacity: u32) -> Self {
        Self {
            devices: devices.into_iter().collect(),
            capacity,
        }
    }

    /// Devices per node when fully free
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Devices per module
    pub fn half(&self) -> u32 {
        self.capacity / 2
    }

    /// Number of free devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is free
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Free devices in ascending order
    pub fn devices(&self) -> Vec<u32> {
        self.devices.iter().copied().collect()
    }

    /// Whether a device is free
    pub fn contains(&self, device: u32) -> bool {
        self.devices.contains(&device)
    }

    /// Free devices in the left module
    pub fn left(&self) -> Vec<u32> {
        let half = self.half();
        self.devices.iter().copied().filter(|d| *d < half).collect()
    }

    /// Free devices in the right module
    pub fn right(&self) -> Vec<u32> {
        let half = self.half();
        self.devices.iter().copied().filter(|d| *d >= half).collect()
    }

    /// Number of devices usable by a task spanning both modules
    ///
    /// Replicas of the same size sharing a node pair lanes by position;
    /// a single task needs physically adjacent pairs.
    pub fn cross_count(&self, multi_replica: bool) -> usize {
        let left = self.left();
        let right = self.right();
        if multi_replica {
            return 2 * left.len().min(right.len());
        }
        let half = self.half();
        2 * left
            .iter()
            .filter(|l| self.devices.contains(&(*l + half)))
            .count()
    }

    /// Candidate device group spanning both modules
    ///
    /// Returns an empty group when it would not exceed one module, since
    /// such a request is better served inside a single module.
    pub fn cross_group(&self, multi_replica: bool) -> Vec<u32> {
        let left = self.left();
        let right = self.right();
        let half = self.half();

        let mut group = Vec::new();
        if multi_replica {
            for (l, r) in left.iter().zip(right.iter()) {
                group.push(*l);
                group.push(*r);
            }
        } else {
            for l in &left {
                if self.devices.contains(&(l + half)) {
                    group.push(*l);
                    group.push(l + half);
                }
            }
        }

        if group.len() <= half as usize {
            return Vec::new();
        }
        group
    }

    /// Topology with `devices` added back (set union)
    pub fn union(&self, devices: &[u32]) -> Self {
        let mut merged = self.devices.clone();
        merged.extend(devices.iter().copied());
        Self {
            devices: merged,
            capacity: self.capacity,
        }
    }

    /// Topology with `devices` taken out
    pub fn without(&self, devices: &[u32]) -> Self {
        let mut remaining = self.devices.clone();
        for d in devices {
            remaining.remove(d);
        }
        Self {
            devices: remaining,
            capacity: self.capacity,
        }
    }
}
