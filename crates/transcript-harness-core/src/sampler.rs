//! Priority-based semantic sampler.
//!
//! Selects the subset of a conversation's messages that fits a token
//! budget while keeping the most diagnostically useful content. Every
//! message is assigned a [`Priority`] tier; the first and last messages are
//! mandatory, the rest are admitted greedily in tier order with earlier
//! messages winning ties.
//!
//! The sampler does not know how messages are rendered. Callers pass a
//! cost function (see [`crate::narrative`]) so that formatting overhead is
//! charged against the same budget as message content.

use std::ops::Range;

use crate::models::{ParsedMessage, SamplingStrategy, ToolPayload};

/// Priority tier, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// First and last message of the conversation.
    Mandatory,
    Error,
    ToolInvocation,
    Reasoning,
    /// First message of an epoch.
    Boundary,
    CodeChange,
    Filler,
}

impl Priority {
    pub fn label(&self) -> &'static str {
        match self {
            Priority::Mandatory => "anchor",
            Priority::Error => "error",
            Priority::ToolInvocation => "tool",
            Priority::Reasoning => "reasoning",
            Priority::Boundary => "turn",
            Priority::CodeChange => "code",
            Priority::Filler => "",
        }
    }
}

const CODE_MARKERS: &[&str] = &["```diff", "diff --git", "*** Begin Patch", "\n@@ ", "\n+++ "];

fn is_code_change(m: &ParsedMessage) -> bool {
    if let Some(ToolPayload::Result { output, .. }) = &m.tool {
        return CODE_MARKERS.iter().any(|k| output.contains(k));
    }
    CODE_MARKERS.iter().any(|k| m.content.contains(k)) || m.content.contains("```")
}

/// Split messages into epochs: consecutive runs that start at an explicit
/// boundary marker or at a user prompt following non-prompt messages.
pub fn epochs(messages: &[ParsedMessage]) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    if messages.is_empty() {
        return ranges;
    }
    let mut start = 0;
    for i in 1..messages.len() {
        let m = &messages[i];
        let turn_start = m.is_user_prompt() && !messages[i - 1].is_user_prompt();
        if m.is_boundary || turn_start {
            ranges.push(start..i);
            start = i;
        }
    }
    ranges.push(start..messages.len());
    ranges
}

/// Assign a priority tier to every message.
pub fn classify(messages: &[ParsedMessage]) -> Vec<Priority> {
    let n = messages.len();
    let epoch_starts: Vec<usize> = epochs(messages).iter().map(|r| r.start).collect();

    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            if i == 0 || i + 1 == n {
                Priority::Mandatory
            } else if m.is_error {
                Priority::Error
            } else if m.tool.as_ref().is_some_and(ToolPayload::is_call) {
                Priority::ToolInvocation
            } else if m.reasoning.as_deref().is_some_and(|r| !r.trim().is_empty()) {
                Priority::Reasoning
            } else if m.is_boundary || epoch_starts.binary_search(&i).is_ok() {
                Priority::Boundary
            } else if is_code_change(m) {
                Priority::CodeChange
            } else {
                Priority::Filler
            }
        })
        .collect()
}

/// Result of a sampling pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Selected message indices in chronological order.
    pub indices: Vec<usize>,
    /// Summed cost of the selected messages.
    pub cost: usize,
}

impl Selection {
    pub fn contains(&self, index: usize) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Selection request for one message sequence.
pub struct SampleRequest<'a> {
    pub messages: &'a [ParsedMessage],
    pub budget: usize,
    pub strategy: SamplingStrategy,
    /// Lowest tier still eligible; used to restrict nested sub-agent
    /// excerpts to high-priority content.
    pub floor: Priority,
}

impl<'a> SampleRequest<'a> {
    pub fn new(messages: &'a [ParsedMessage], budget: usize, strategy: SamplingStrategy) -> Self {
        Self {
            messages,
            budget,
            strategy,
            floor: Priority::Filler,
        }
    }

    pub fn with_floor(mut self, floor: Priority) -> Self {
        self.floor = floor;
        self
    }
}

/// Select messages under `request.budget`.
///
/// Mandatory messages are always selected, even when their cost alone
/// exceeds the budget; callers shrink their rendering in that case. All
/// other admissions stop at the first candidate that would overflow.
pub fn select<F>(request: &SampleRequest<'_>, cost: F) -> Selection
where
    F: Fn(usize, &ParsedMessage) -> usize,
{
    let messages = request.messages;
    let n = messages.len();
    if n == 0 {
        return Selection::default();
    }

    if !request.strategy.is_bounded() {
        let total = messages.iter().enumerate().map(|(i, m)| cost(i, m)).sum();
        return Selection {
            indices: (0..n).collect(),
            cost: total,
        };
    }

    let priorities = classify(messages);
    let mut chosen = vec![false; n];
    let mut used = 0usize;

    for i in [0, n - 1] {
        if !chosen[i] {
            chosen[i] = true;
            used += cost(i, &messages[i]);
        }
    }

    let admit = |i: usize, used: &mut usize, chosen: &mut [bool]| -> bool {
        let c = cost(i, &messages[i]);
        if *used + c > request.budget {
            return false;
        }
        *used += c;
        chosen[i] = true;
        true
    };

    if request.strategy == SamplingStrategy::Epoch {
        let ranges = epochs(messages);
        let mut anchors: Vec<usize> = Vec::new();
        if let Some(first) = ranges.first() {
            anchors.extend(first.clone());
        }
        if ranges.len() > 1 {
            if let Some(last) = ranges.last() {
                anchors.extend(last.clone());
            }
        }
        for i in anchors {
            if chosen[i] || priorities[i] > request.floor {
                continue;
            }
            if !admit(i, &mut used, &mut chosen) {
                break;
            }
        }
    }

    let mut candidates: Vec<usize> = (0..n)
        .filter(|&i| !chosen[i] && priorities[i] <= request.floor)
        .collect();
    candidates.sort_by_key(|&i| (priorities[i], i));

    for i in candidates {
        if !admit(i, &mut used, &mut chosen) {
            break;
        }
    }

    Selection {
        indices: (0..n).filter(|&i| chosen[i]).collect(),
        cost: used,
    }
}
