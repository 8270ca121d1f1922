//! The ramp registry: every per-ramp component is addressed by [`RampId`].
//!
//! Ramps are sorted by corridor position when the registry is built, so the
//! index order is upstream → downstream and neighbour lookups are index
//! arithmetic.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::CorridorConfig;
use crate::error::{KernelError, Result};

/// Stable index of a ramp in the [`Corridor`] arena.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RampId(pub usize);

impl RampId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for RampId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ramp#{}", self.0)
    }
}

/// Immutable geometry of one metered on-ramp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ramp {
    pub id: RampId,
    pub name: String,
    /// Number of metered lanes
    pub lanes: u32,
    /// Vehicles stored before spillback
    pub storage_capacity: u32,
    /// Position along the corridor (metres, increasing downstream)
    pub position_m: f64,
}

/// Arena of ramp records, ordered upstream → downstream.
#[derive(Debug, Clone)]
pub struct Corridor {
    ramps: Vec<Ramp>,
    by_name: HashMap<String, RampId>,
}

impl Corridor {
    /// Validate the configuration and build the registry from its geometry table.
    pub fn from_config(config: &CorridorConfig) -> Result<Self> {
        config.validate()?;

        let mut geometry: Vec<_> = config.ramps.iter().collect();
        geometry.sort_by(|a, b| a.position_m.total_cmp(&b.position_m));

        let ramps: Vec<Ramp> = geometry
            .into_iter()
            .enumerate()
            .map(|(index, cfg)| Ramp {
                id: RampId(index),
                name: cfg.name.clone(),
                lanes: cfg.lanes,
                storage_capacity: cfg.storage_capacity,
                position_m: cfg.position_m,
            })
            .collect();

        let by_name = ramps.iter().map(|r| (r.name.clone(), r.id)).collect();

        Ok(Self { ramps, by_name })
    }

    pub fn len(&self) -> usize {
        self.ramps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ramps.is_empty()
    }

    /// All ramps, upstream first.
    pub fn ramps(&self) -> &[Ramp] {
        &self.ramps
    }

    /// Look up a ramp by index.
    pub fn ramp(&self, id: RampId) -> Result<&Ramp> {
        self.ramps.get(id.0).ok_or(KernelError::RampOutOfBounds {
            index: id.0,
            len: self.ramps.len(),
        })
    }

    /// Resolve a configured name to its index.
    pub fn id_of(&self, name: &str) -> Option<RampId> {
        self.by_name.get(name).copied()
    }

    /// Ramp ids, upstream first.
    pub fn ids(&self) -> impl DoubleEndedIterator<Item = RampId> + '_ {
        self.ramps.iter().map(|r| r.id)
    }

    /// Ramp ids in coordination scan order (downstream first).
    pub fn downstream_to_upstream(&self) -> impl Iterator<Item = RampId> + '_ {
        self.ids().rev()
    }

    /// Up to `radius` ramps immediately downstream of `id`, nearest first,
    /// optionally limited to those within `max_distance_m`.
    pub fn downstream_neighbors(
        &self,
        id: RampId,
        radius: usize,
        max_distance_m: Option<f64>,
    ) -> Result<Vec<RampId>> {
        let origin = self.ramp(id)?.position_m;
        let start = id.0 + 1;
        let end = start.saturating_add(radius).min(self.ramps.len());

        Ok(self.ramps[start.min(end)..end]
            .iter()
            .take_while(|r| max_distance_m.is_none_or(|d| r.position_m - origin <= d))
            .map(|r| r.id)
            .collect())
    }
}
