//! Motion tracking helpers: direction inference and the watch slot

use tokio::task::JoinHandle;

use crate::models::{Direction, Phase};

/// A running fast-poll task. At most one per coordinator.
pub(crate) struct ActiveWatch {
    pub id: u64,
    pub handle: JoinHandle<()>,
}

impl ActiveWatch {
    pub fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Abort a background task and wait for it, discarding the cancellation
pub(crate) async fn cancel_and_join(handle: JoinHandle<()>, what: &str) {
    handle.abort();
    match handle.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!("[Coordinator] {} task failed: {}", what, e),
    }
}

/// Work out which way the gate is travelling.
///
/// A transitional phase is authoritative and a steady phase means no
/// direction. Only an unrecognised phase falls back to comparing positions.
pub fn infer_direction(phase: i64, last_pos: Option<i64>, new_pos: i64) -> Option<Direction> {
    match Phase::from_code(phase) {
        Some(Phase::Opening) => return Some(Direction::Opening),
        Some(Phase::Closing) => return Some(Direction::Closing),
        Some(Phase::Open | Phase::Closed | Phase::Stopped) => return None,
        None => {}
    }

    let last = last_pos?;
    if new_pos == last {
        return None;
    }

    if 0 < new_pos && new_pos < 100 {
        Some(if new_pos > last {
            Direction::Opening
        } else {
            Direction::Closing
        })
    } else if new_pos == 0 && last > 0 {
        Some(Direction::Closing)
    } else if new_pos == 100 && last < 100 {
        Some(Direction::Opening)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitional_phase_is_authoritative() {
        assert_eq!(infer_direction(Phase::OPENING, Some(80), 20), Some(Direction::Opening));
        assert_eq!(infer_direction(Phase::CLOSING, Some(20), 80), Some(Direction::Closing));
    }

    #[test]
    fn test_steady_phase_has_no_direction() {
        for phase in [Phase::OPEN, Phase::CLOSED, Phase::STOPPED] {
            assert_eq!(infer_direction(phase, Some(10), 60), None);
        }
    }

    #[test]
    fn test_unknown_phase_uses_position_delta() {
        assert_eq!(infer_direction(23, Some(10), 60), Some(Direction::Opening));
        assert_eq!(infer_direction(23, Some(60), 10), Some(Direction::Closing));
        assert_eq!(infer_direction(23, Some(60), 60), None);
        assert_eq!(infer_direction(23, None, 60), None);
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(infer_direction(23, Some(5), 0), Some(Direction::Closing));
        assert_eq!(infer_direction(23, Some(95), 100), Some(Direction::Opening));
        // Out-of-range readings never imply travel
        assert_eq!(infer_direction(23, Some(50), 120), None);
        assert_eq!(infer_direction(23, Some(50), -3), None);
    }
}
