//! Narrative builder for canonical artifacts.
//!
//! Renders a sampled conversation (plus nested sub-agent excerpts) into one
//! deterministic text document for a downstream text-generation consumer.
//!
//! Every piece of text the builder emits is charged against the budget:
//! the header, section titles, omission markers, and the footer are
//! reserved up front at their widest possible rendering, and each message
//! is charged for its full rendered block plus one omission marker. Since
//! [`estimate_tokens`] is subadditive the finished text never exceeds the
//! budget for bounded strategies.

use chrono::{DateTime, Utc};

use crate::models::{
    CanonicalArtifact, Conversation, ParsedMessage, SamplingStrategy, ToolPayload,
};
use crate::sampler::{classify, select, Priority, SampleRequest, Selection};
use crate::tokens::{chars_for_tokens, estimate_tokens, excerpt, truncate_chars};

/// Bumped whenever rendering or selection changes in a way that should
/// invalidate cached artifacts.
pub const STRATEGY_VERSION: u32 = 1;

/// Smallest budget that leaves room for the header, both anchor messages
/// at a minimal excerpt, and the footer.
pub const MIN_BUDGET: usize = 256;

/// Settings for one artifact build.
#[derive(Debug, Clone)]
pub struct NarrativeConfig {
    pub canonical_type: String,
    pub budget: usize,
    pub strategy: SamplingStrategy,
    /// Share of the post-header budget reserved for sub-agent excerpts.
    pub child_budget_fraction: f64,
    /// Per-message excerpt cap for bounded strategies.
    pub max_message_tokens: usize,
}

/// A conversation and its ordered messages.
#[derive(Debug, Clone, Copy)]
pub struct Thread<'a> {
    pub conversation: &'a Conversation,
    pub messages: &'a [ParsedMessage],
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn render_header(root: &Thread<'_>, config: &NarrativeConfig) -> String {
    let conv = root.conversation;
    let mut out = format!("# Conversation {}\n", conv.id);
    out.push_str(&format!("source: {}\n", conv.source_path));
    out.push_str(&format!("tool: {}\n", conv.parser));
    if let Some(parent) = &conv.parent_id {
        out.push_str(&format!("parent: {}\n", parent));
    }
    match (&conv.started_at, &conv.ended_at) {
        (Some(s), Some(e)) => out.push_str(&format!("span: {} .. {}\n", format_ts(s), format_ts(e))),
        (Some(s), None) => out.push_str(&format!("span: {} ..\n", format_ts(s))),
        _ => {}
    }
    out.push_str(&format!("messages: {}\n", root.messages.len()));
    out.push_str(&format!(
        "artifact: {} / {} v{} / budget {}\n\n",
        config.canonical_type, config.strategy, STRATEGY_VERSION, config.budget
    ));
    out
}

const TRANSCRIPT_TITLE: &str = "## Transcript\n";

fn render_child_title(child: &Thread<'_>) -> String {
    format!(
        "\n## Sub-agent {} ({} messages)\n",
        child.conversation.id,
        child.messages.len()
    )
}

fn render_gap(omitted: usize) -> String {
    format!("[... {} messages omitted ...]\n", omitted)
}

fn render_footer(selected: usize, total: usize) -> String {
    format!("\n[selected {} of {} messages]\n", selected, total)
}

fn render_block(m: &ParsedMessage, priority: Priority, cap: usize) -> String {
    let mut head = format!("[{}] {}", m.seq, m.role);
    if let Some(author) = &m.author {
        head.push_str(&format!(" ({})", author));
    }
    if let Some(ts) = &m.timestamp {
        head.push(' ');
        head.push_str(&format_ts(ts));
    }
    let label = priority.label();
    if !label.is_empty() {
        head.push_str(" #");
        head.push_str(label);
    }
    if m.is_error && priority != Priority::Error {
        head.push_str(" #error");
    }

    let mut body = match &m.tool {
        Some(ToolPayload::Call { name, .. }) => format!("-> {}: {}", name, m.content),
        Some(ToolPayload::Result { is_error: true, .. }) => format!("<- error: {}", m.content),
        Some(ToolPayload::Result { .. }) => format!("<- result: {}", m.content),
        None => m.content.clone(),
    };
    if let Some(reasoning) = m.reasoning.as_deref().filter(|r| !r.trim().is_empty()) {
        if body.is_empty() {
            body = format!("(reasoning) {}", reasoning);
        } else {
            body = format!("(reasoning) {}\n{}", reasoning, body);
        }
    }

    format!("{}\n{}\n\n", head, excerpt(body.trim_end(), cap))
}

/// Token cost charged for one message at excerpt cap `cap`.
///
/// Includes the omission marker that may precede the block.
pub fn message_cost(m: &ParsedMessage, priority: Priority, cap: usize, total: usize) -> usize {
    estimate_tokens(&render_block(m, priority, cap)) + estimate_tokens(&render_gap(total))
}

/// Select from one thread, halving the excerpt cap until mandatory
/// messages fit or the cap reaches zero.
fn sample_thread(
    messages: &[ParsedMessage],
    priorities: &[Priority],
    budget: usize,
    strategy: SamplingStrategy,
    floor: Priority,
    mut cap: usize,
) -> (Selection, usize) {
    let total = messages.len();
    let request = SampleRequest::new(messages, budget, strategy).with_floor(floor);
    loop {
        let sel = select(&request, |i, m| message_cost(m, priorities[i], cap, total));
        if !strategy.is_bounded() || sel.cost <= budget || cap == 0 {
            return (sel, cap);
        }
        cap /= 2;
    }
}

fn render_selection(
    out: &mut String,
    messages: &[ParsedMessage],
    priorities: &[Priority],
    selection: &Selection,
    cap: usize,
) {
    let mut next = 0usize;
    for &i in &selection.indices {
        if i > next {
            out.push_str(&render_gap(i - next));
        }
        out.push_str(&render_block(&messages[i], priorities[i], cap));
        next = i + 1;
    }
    if next < messages.len() {
        out.push_str(&render_gap(messages.len() - next));
    }
}

/// Selected blocks without omission markers, followed by the footer.
fn compact_body(
    messages: &[ParsedMessage],
    priorities: &[Priority],
    selection: &Selection,
    cap: usize,
    footer: &str,
) -> String {
    let mut body = String::new();
    for &i in &selection.indices {
        body.push_str(&render_block(&messages[i], priorities[i], cap));
    }
    body.push_str(footer);
    body
}

/// Join `head` and `tail` within `budget`, cutting `head` first.
fn fit_tail_first(head: &str, tail: &str, budget: usize) -> String {
    let max_chars = chars_for_tokens(budget);
    let tail_chars = tail.chars().count();
    if tail_chars >= max_chars {
        return truncate_chars(tail, max_chars).to_string();
    }
    let mut out = truncate_chars(head, max_chars - tail_chars).to_string();
    out.push_str(tail);
    out
}

/// Build a canonical artifact for `root`, with optional sub-agent threads.
///
/// Output depends only on the inputs and `config` (except `created_at`),
/// so artifacts can be cached by conversation, type, and strategy version.
pub fn build_artifact(
    root: Thread<'_>,
    children: &[Thread<'_>],
    config: &NarrativeConfig,
) -> CanonicalArtifact {
    let bounded = config.strategy.is_bounded();
    let cap = if bounded {
        config.max_message_tokens
    } else {
        usize::MAX
    };
    let total = root.messages.len();

    let header = render_header(&root, config);
    let overhead = estimate_tokens(&header)
        + estimate_tokens(TRANSCRIPT_TITLE)
        + estimate_tokens(&render_footer(total, total))
        + estimate_tokens(&render_gap(total));
    let mut remaining = config.budget.saturating_sub(overhead);

    let mut ordered: Vec<&Thread<'_>> = children.iter().collect();
    ordered.sort_by(|a, b| a.conversation.id.cmp(&b.conversation.id));

    let mut child_sections = String::new();
    if !ordered.is_empty() {
        let pool = (remaining as f64 * config.child_budget_fraction).floor() as usize;
        let share = pool / ordered.len();
        for child in ordered {
            if child.messages.is_empty() {
                continue;
            }
            let title = render_child_title(child);
            let child_total = child.messages.len();
            let section_overhead =
                estimate_tokens(&title) + estimate_tokens(&render_gap(child_total));
            if bounded && share <= section_overhead {
                continue;
            }
            let child_budget = share.saturating_sub(section_overhead);
            let priorities = classify(child.messages);
            let (sel, child_cap) = sample_thread(
                child.messages,
                &priorities,
                child_budget,
                config.strategy,
                Priority::Reasoning,
                cap,
            );
            if bounded && sel.cost > child_budget {
                continue;
            }
            child_sections.push_str(&title);
            render_selection(
                &mut child_sections,
                child.messages,
                &priorities,
                &sel,
                child_cap,
            );
            remaining = remaining.saturating_sub(section_overhead + sel.cost);
        }
    }

    let priorities = classify(root.messages);
    let (selection, root_cap) = sample_thread(
        root.messages,
        &priorities,
        remaining,
        config.strategy,
        Priority::Filler,
        cap,
    );

    let preamble = format!("{}{}", header, TRANSCRIPT_TITLE);
    let footer = render_footer(selection.len(), total);
    let mut text = preamble.clone();
    render_selection(&mut text, root.messages, &priorities, &selection, root_cap);
    text.push_str(&child_sections);
    text.push_str(&footer);

    if bounded && estimate_tokens(&text) > config.budget {
        // Below MIN_BUDGET the fixed text can outgrow the budget. Shed
        // omission markers and sub-agents, then the header, so the selected
        // blocks and the footer are the last to go.
        let body = compact_body(root.messages, &priorities, &selection, root_cap, &footer);
        text = fit_tail_first(&preamble, &body, config.budget);
    }

    CanonicalArtifact {
        conversation_id: root.conversation.id.clone(),
        canonical_type: config.canonical_type.clone(),
        strategy: config.strategy,
        strategy_version: STRATEGY_VERSION,
        source_revision: root.conversation.revision,
        budget: config.budget,
        token_count: estimate_tokens(&text),
        messages_selected: selection.len(),
        messages_total: total,
        text,
        created_at: Utc::now().timestamp(),
    }
}
