//! The bipartite tracks graph: which shot observed which track, and where
//! in the image.

use crate::map::{ShotId, TrackId};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single feature observation: the detected 2D position in pixels plus the
/// feature payload (detection scale, feature id, sampled color) that travels
/// with it through re-keying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub point: Vector2<f64>,
    pub scale: f64,
    pub id: u64,
    pub color: [f64; 3],
}

impl Observation {
    pub fn new(point: Vector2<f64>, scale: f64, id: u64, color: [f64; 3]) -> Self {
        Observation {
            point,
            scale,
            id,
            color,
        }
    }

    /// The same observation at a different image position.
    pub fn with_point(&self, point: Vector2<f64>) -> Observation {
        Observation {
            point,
            ..self.clone()
        }
    }
}

/// Shot-to-track observation store. Edges are keyed `(shot, track)` and both
/// levels iterate in sorted id order, so walking the graph is reproducible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracksManager {
    observations: BTreeMap<ShotId, BTreeMap<TrackId, Observation>>,
}

impl TracksManager {
    pub fn new() -> Self {
        TracksManager::default()
    }

    pub fn add_observation(&mut self, shot_id: &str, track_id: &str, observation: Observation) {
        self.observations
            .entry(shot_id.to_string())
            .or_default()
            .insert(track_id.to_string(), observation);
    }

    pub fn has_shot(&self, shot_id: &str) -> bool {
        self.observations.contains_key(shot_id)
    }

    /// All observations made by one shot, keyed by track id.
    pub fn shot_observations(&self, shot_id: &str) -> Option<&BTreeMap<TrackId, Observation>> {
        self.observations.get(shot_id)
    }

    pub fn shot_ids(&self) -> impl Iterator<Item = &ShotId> {
        self.observations.keys()
    }

    pub fn num_shots(&self) -> usize {
        self.observations.len()
    }

    /// Total number of `(shot, track)` edges in the graph.
    pub fn num_observations(&self) -> usize {
        self.observations.values().map(BTreeMap::len).sum()
    }

    pub fn num_shot_observations(&self, shot_id: &str) -> usize {
        self.observations.get(shot_id).map_or(0, BTreeMap::len)
    }
}
