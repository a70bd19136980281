//! Subscriber positions and their tether state.
//!
//! A tethered subscriber always holds back the publication window. An
//! untethered one is allowed to fall behind: it lingers, then rests (its
//! position no longer considered), then rejoins at the live position.

use skein_primitives::Position;

/// Tether lifecycle of one subscriber position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TetherState {
    /// Position counts towards the minimum consumer position.
    Active,
    /// Outside the window; grace period before resting.
    Linger,
    /// Parked. Position is ignored until rejoin.
    Resting,
}

/// One subscriber's position as tracked by the conductor.
pub struct TetherablePosition {
    /// The subscriber's position cell. The subscriber advances it; the
    /// conductor only writes it when rejoining a rested subscriber.
    pub position: Position,
    /// False for subscribers that may fall behind and be reset.
    pub is_tether: bool,
    pub state: TetherState,
    /// Time the state last changed, or the position was last observed
    /// inside the window.
    pub time_of_last_update_ns: i64,
}

impl TetherablePosition {
    pub fn new(position: Position, is_tether: bool, now_ns: i64) -> Self {
        Self {
            position,
            is_tether,
            state: TetherState::Active,
            time_of_last_update_ns: now_ns,
        }
    }

    /// Counter id of the underlying position cell.
    #[inline]
    pub fn counter_id(&self) -> i32 {
        self.position.id()
    }

    /// True if this position should hold back the publication window.
    #[inline]
    pub fn is_consuming(&self) -> bool {
        self.state != TetherState::Resting
    }
}
