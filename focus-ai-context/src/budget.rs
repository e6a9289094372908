//! Greedy packing of context fragments into a token budget.
//!
//! Fragments arrive in three priority classes. Pinned content is packed first against its own
//! sub-budget; retrieved and history fragments then fill what remains of the total. Packing is
//! all-or-nothing per fragment: nothing is ever truncated, and once a fragment does not fit the
//! phase stops rather than skipping ahead to a smaller one.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentSource {
    Pinned,
    Retrieved,
    History,
}

impl std::fmt::Display for FragmentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FragmentSource::Pinned => "pinned",
            FragmentSource::Retrieved => "retrieved",
            FragmentSource::History => "history",
        };
        f.write_str(name)
    }
}

/// One unit of assembled context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextFragment {
    pub source: FragmentSource,
    pub text: String,
    pub token_count: usize,
    /// Child chunk id for pinned and retrieved fragments.
    pub chunk_id: Option<String>,
    pub document_id: Option<i64>,
    /// Similarity score for retrieved fragments.
    pub score: Option<f32>,
    /// Message id and role for history fragments.
    pub message_id: Option<i64>,
    pub role: Option<String>,
}

impl ContextFragment {
    pub fn pinned(chunk_id: String, document_id: i64, text: String, token_count: usize) -> Self {
        Self {
            source: FragmentSource::Pinned,
            text,
            token_count,
            chunk_id: Some(chunk_id),
            document_id: Some(document_id),
            score: None,
            message_id: None,
            role: None,
        }
    }

    pub fn retrieved(
        chunk_id: String,
        document_id: i64,
        text: String,
        token_count: usize,
        score: f32,
    ) -> Self {
        Self {
            source: FragmentSource::Retrieved,
            text,
            token_count,
            chunk_id: Some(chunk_id),
            document_id: Some(document_id),
            score: Some(score),
            message_id: None,
            role: None,
        }
    }

    pub fn history(message_id: i64, role: String, text: String, token_count: usize) -> Self {
        Self {
            source: FragmentSource::History,
            text,
            token_count,
            chunk_id: None,
            document_id: None,
            score: None,
            message_id: Some(message_id),
            role: Some(role),
        }
    }
}

/// Total budget plus the share reserved for pinned content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextBudget {
    pub total: usize,
    pub pinned: usize,
}

impl ContextBudget {
    /// `pinned_share` is clamped to [0, 1].
    pub fn with_pinned_share(total: usize, pinned_share: f32) -> Self {
        let share = pinned_share.clamp(0.0, 1.0);
        Self {
            total,
            pinned: ((total as f32) * share).floor() as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackedContext {
    pub fragments: Vec<ContextFragment>,
    pub used_tokens: usize,
    pub budget: ContextBudget,
    /// Candidate fragments left out because the budget ran out.
    pub dropped: usize,
}

impl PackedContext {
    pub fn tokens_for(&self, source: FragmentSource) -> usize {
        self.fragments
            .iter()
            .filter(|f| f.source == source)
            .map(|f| f.token_count)
            .sum()
    }
}

/// Pack fragments in priority order: `pinned` against `budget.pinned`, then `retrieved` followed by
/// `history` against `budget.total`. Each phase stops at the first fragment that would overflow.
///
/// Retrieved hits and history share one phase, so a hit that does not fit also leaves out every
/// history turn, even turns small enough to fit in what remains.
pub fn pack_fragments(
    budget: ContextBudget,
    pinned: Vec<ContextFragment>,
    retrieved: Vec<ContextFragment>,
    history: Vec<ContextFragment>,
) -> PackedContext {
    let pinned_limit = budget.pinned.min(budget.total);
    let candidates = pinned.len() + retrieved.len() + history.len();
    let mut fragments = Vec::with_capacity(candidates);
    let mut used = 0usize;

    for fragment in pinned {
        if used + fragment.token_count > pinned_limit {
            break;
        }
        used += fragment.token_count;
        fragments.push(fragment);
    }

    for fragment in retrieved.into_iter().chain(history) {
        if used + fragment.token_count > budget.total {
            break;
        }
        used += fragment.token_count;
        fragments.push(fragment);
    }

    PackedContext {
        dropped: candidates - fragments.len(),
        fragments,
        used_tokens: used,
        budget,
    }
}
