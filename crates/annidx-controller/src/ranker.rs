use std::collections::HashMap;

use annidx_core::{Result, Uid};

/// Interface contract for the external relevance-feedback collaborator (an
/// IQR-style session): it calls into the index's identifier space but is
/// never implemented by this crate, mirroring the `Collection` seam this
/// project's grounding codebase draws between its storage core and
/// pluggable higher-level behavior.
///
/// A ranker scores every known uid against a user's positive/negative
/// adjudications; `reset` clears whatever it learned. The core index
/// supplies identifier consistency (stable uids across build/update/remove)
/// and nothing else -- ranking, adjudication bookkeeping, and session
/// locking all live above this trait.
pub trait RelevanceRanker: Send + Sync {
    /// Scores every uid the ranker knows about given the current positive
    /// and negative adjudication sets. Must return a probability in
    /// `[0, 1]` for every known uid.
    fn rank_model(
        &self,
        positive_uids: &[Uid],
        negative_uids: &[Uid],
    ) -> Result<HashMap<Uid, f32>>;

    /// Clears any learned ranking state.
    fn reset(&self) -> Result<()>;
}
