use std::collections::HashMap;

use shared::domain::{ClientId, Position};

/// Marker coloring: the local user's marker renders red, everyone else
/// black.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coloring {
    Own,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub coloring: Coloring,
    pub position: Position,
}

/// One row of the rendered roster projection.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerView {
    pub client_id: ClientId,
    pub coloring: Coloring,
    pub position: Position,
}

/// The live set of markers, keyed by client identifier. This map is the
/// only record of which markers exist; rendering reads [`Roster::snapshot`]
/// and holds no state of its own.
#[derive(Debug, Default)]
pub struct Roster {
    markers: HashMap<ClientId, Marker>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client_id: ClientId, coloring: Coloring, position: Position) {
        self.markers.insert(client_id, Marker { coloring, position });
    }

    /// Apply a `move`: create the marker first if this identifier has never
    /// been sighted, then overwrite its position. Existing markers keep
    /// their coloring.
    pub fn apply_move(&mut self, client_id: &ClientId, position: Position, coloring_if_new: Coloring) {
        match self.markers.get_mut(client_id) {
            Some(marker) => marker.position = position,
            None => {
                self.markers.insert(
                    client_id.clone(),
                    Marker {
                        coloring: coloring_if_new,
                        position,
                    },
                );
            }
        }
    }

    /// Remove the marker for a departed client. Removing an identifier with
    /// no marker is a no-op.
    pub fn remove(&mut self, client_id: &ClientId) -> bool {
        self.markers.remove(client_id).is_some()
    }

    pub fn position_of(&self, client_id: &ClientId) -> Option<Position> {
        self.markers.get(client_id).map(|marker| marker.position)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.markers.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    /// Pure projection of the marker map, ordered by identifier.
    pub fn snapshot(&self) -> Vec<MarkerView> {
        let mut views: Vec<MarkerView> = self
            .markers
            .iter()
            .map(|(client_id, marker)| MarkerView {
                client_id: client_id.clone(),
                coloring: marker.coloring,
                position: marker.position,
            })
            .collect();
        views.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        views
    }
}
