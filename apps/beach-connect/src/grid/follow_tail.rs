pub const REASON_NO_SNAPSHOT: &str = "auto-tail:no-snapshot";
pub const REASON_ALREADY_FOLLOWING: &str = "auto-tail:already-following";
pub const REASON_EMPTY_GRID: &str = "auto-tail:empty-grid";
pub const REASON_FITS_VIEWPORT: &str = "auto-tail:fits-viewport";
pub const REASON_PRESERVE_MANUAL_SCROLL: &str = "preserve-manual-scroll";

/// Grid state observed just before a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowTailInput {
    pub follow_tail: bool,
    pub row_count: usize,
    pub viewport_height: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowTailDecision {
    pub enable: bool,
    pub reason: &'static str,
}

impl FollowTailDecision {
    const fn enable(reason: &'static str) -> Self {
        Self {
            enable: true,
            reason,
        }
    }
}

/// Decide whether follow-tail should be on after the grid is reset.
///
/// Tailing is kept unless the user had scrolled away from a grid taller than
/// the viewport, in which case their manual position wins.
pub fn decide_follow_tail_restore(prior: Option<&FollowTailInput>) -> FollowTailDecision {
    let Some(prior) = prior else {
        return FollowTailDecision::enable(REASON_NO_SNAPSHOT);
    };
    if prior.follow_tail {
        return FollowTailDecision::enable(REASON_ALREADY_FOLLOWING);
    }
    if prior.row_count == 0 {
        return FollowTailDecision::enable(REASON_EMPTY_GRID);
    }
    if prior.row_count <= prior.viewport_height {
        return FollowTailDecision::enable(REASON_FITS_VIEWPORT);
    }
    FollowTailDecision {
        enable: false,
        reason: REASON_PRESERVE_MANUAL_SCROLL,
    }
}
