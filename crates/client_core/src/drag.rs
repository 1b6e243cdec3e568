use shared::domain::Position;

/// Pointer offset inside the own marker captured at grab time; every
/// dragged position stays anchored to it so the marker does not jump under
/// the pointer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragState {
    grab_dx: f64,
    grab_dy: f64,
}

impl DragState {
    pub fn begin(pointer_x: f64, pointer_y: f64, marker: Position) -> Self {
        Self {
            grab_dx: pointer_x - marker.pagex,
            grab_dy: pointer_y - marker.pagey,
        }
    }

    pub fn position_for(&self, page_x: f64, page_y: f64) -> Position {
        Position::new(page_x - self.grab_dx, page_y - self.grab_dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dragged_positions_anchor_to_the_grab_offset() {
        let drag = DragState::begin(14.0, 25.0, Position::new(10.0, 20.0));
        assert_eq!(drag.position_for(50.0, 80.0), Position::new(46.0, 75.0));
    }

    #[test]
    fn grabbing_the_marker_origin_moves_one_to_one() {
        let drag = DragState::begin(10.0, 20.0, Position::new(10.0, 20.0));
        assert_eq!(drag.position_for(33.0, 44.0), Position::new(33.0, 44.0));
    }
}
