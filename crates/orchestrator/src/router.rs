//! Capability router — picks which immediate children to engage for a task.
//!
//! Pure keyword-overlap scoring with a depth penalty; no LLM involvement.
//! Results are deterministic for identical inputs, ties breaking toward the
//! lexicographically smallest child id. The router never fans out to all
//! children by default: a child engages only when its score clears the
//! threshold, or — as a fallback — when the task literally contains one of
//! the best child's keywords.

use canopy_core::capability::Capability;
use std::collections::BTreeSet;

/// Score deduction per level of depth, keeping the engaged set shallow.
const DEPTH_PENALTY: f32 = 0.1;

/// Select the children of `agent` to engage for `task`.
///
/// Returns child agent ids ordered lexicographically.
pub fn select_children(task: &str, agent: &Capability, threshold: f32) -> Vec<String> {
    if agent.children.is_empty() {
        return Vec::new();
    }

    let task_tokens = tokenize(task);

    // Sort by id up front so scoring, selection, and the fallback pick are
    // all deterministic regardless of the capability tree's child order.
    let mut children: Vec<&Capability> = agent.children.iter().collect();
    children.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

    let scored: Vec<(&Capability, f32)> = children
        .iter()
        .map(|child| (*child, score(&task_tokens, child)))
        .collect();

    let selected: Vec<String> = scored
        .iter()
        .filter(|(_, s)| *s > threshold)
        .map(|(child, _)| child.agent_id.clone())
        .collect();

    if !selected.is_empty() {
        return selected;
    }

    // Fallback: the single best child, but only when the task actually
    // contains one of its keywords. Strictly-greater keeps the first
    // (smallest id) on ties.
    let mut best: Option<(&Capability, f32)> = None;
    for (child, s) in &scored {
        match best {
            Some((_, best_score)) if *s <= best_score => {}
            _ => best = Some((child, *s)),
        }
    }

    match best {
        Some((child, _)) if contains_any_keyword(&task_tokens, &child.keywords) => {
            vec![child.agent_id.clone()]
        }
        _ => Vec::new(),
    }
}

/// `keyword_match(task, keywords) − depth_penalty`.
fn score(task_tokens: &BTreeSet<String>, child: &Capability) -> f32 {
    keyword_match(task_tokens, &child.keywords) - DEPTH_PENALTY * child.depth as f32
}

/// Normalized overlap of the task's token set with the child's keyword
/// token set: |task ∩ keywords| / |keywords|.
fn keyword_match(task_tokens: &BTreeSet<String>, keywords: &[String]) -> f32 {
    let keyword_tokens: BTreeSet<String> = keywords.iter().flat_map(|k| tokenize(k)).collect();
    if keyword_tokens.is_empty() {
        return 0.0;
    }
    let overlap = keyword_tokens.intersection(task_tokens).count();
    overlap as f32 / keyword_tokens.len() as f32
}

/// Whether the task contains at least one full keyword (all of the
/// keyword's tokens present, order-insensitive).
fn contains_any_keyword(task_tokens: &BTreeSet<String>, keywords: &[String]) -> bool {
    keywords.iter().any(|keyword| {
        let tokens = tokenize(keyword);
        !tokens.is_empty() && tokens.iter().all(|t| task_tokens.contains(t))
    })
}

/// Case-folded alphanumeric token set with naive plural folding, so
/// "flights" in a task meets "flight booking" in a keyword set.
fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| singular(&w.to_lowercase()))
        .collect()
}

fn singular(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(id: &str, depth: usize, keywords: &[&str]) -> Capability {
        Capability {
            agent_id: id.into(),
            agent_name: id.to_uppercase(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            confidence: 0.7,
            depth,
            children: vec![],
        }
    }

    fn parent(children: Vec<Capability>) -> Capability {
        Capability {
            agent_id: "root".into(),
            agent_name: "Root".into(),
            keywords: vec!["coordination".into()],
            confidence: 0.7,
            depth: 0,
            children,
        }
    }

    #[test]
    fn no_children_yields_empty() {
        let agent = parent(vec![]);
        assert!(select_children("anything", &agent, 0.0).is_empty());
    }

    #[test]
    fn selects_matching_children() {
        let agent = parent(vec![
            child("flights", 1, &["flight booking", "airlines"]),
            child("hotels", 1, &["hotel recommendations"]),
            child("weather", 1, &["weather forecasts"]),
        ]);

        let selected = select_children("plan trip: flights and hotels", &agent, 0.0);
        assert_eq!(selected, vec!["flights", "hotels"]);
    }

    #[test]
    fn irrelevant_task_selects_nothing() {
        let agent = parent(vec![
            child("flights", 1, &["flight booking"]),
            child("hotels", 1, &["hotel recommendations"]),
        ]);

        let selected = select_children("write me a poem about the sea", &agent, 0.0);
        assert!(selected.is_empty());
    }

    #[test]
    fn depth_penalty_prefers_shallow_agents() {
        let shallow = child("a-shallow", 1, &["billing"]);
        let deep = child("b-deep", 5, &["billing"]);
        let task_tokens = tokenize("billing question");

        assert!(score(&task_tokens, &shallow) > score(&task_tokens, &deep));
    }

    #[test]
    fn fallback_requires_keyword_containment() {
        // Partial overlap below zero after the depth penalty, so the
        // threshold filter selects nothing; the fallback picks the best
        // child only because "flight" appears verbatim.
        let agent = parent(vec![child(
            "flights",
            4,
            &["flight", "booking", "airlines", "seats", "fares"],
        )]);

        let selected = select_children("flight", &agent, 0.0);
        assert_eq!(selected, vec!["flights"]);

        let selected = select_children("something unrelated entirely", &agent, 0.0);
        assert!(selected.is_empty());
    }

    #[test]
    fn deterministic_across_invocations() {
        let agent = parent(vec![
            child("b", 1, &["data analysis"]),
            child("a", 1, &["data analysis"]),
        ]);

        let first = select_children("analysis of data", &agent, 0.0);
        for _ in 0..10 {
            assert_eq!(select_children("analysis of data", &agent, 0.0), first);
        }
        // Equal scores: ordered lexicographically.
        assert_eq!(first, vec!["a", "b"]);
    }

    #[test]
    fn tie_break_in_fallback_is_lexicographic() {
        // Two identical deep children: fallback must pick "a" every time.
        let agent = parent(vec![
            child("b", 4, &["astronomy", "telescopes", "optics"]),
            child("a", 4, &["astronomy", "telescopes", "optics"]),
        ]);

        let selected = select_children("astronomy", &agent, 0.0);
        assert_eq!(selected, vec!["a"]);
    }

    #[test]
    fn empty_keywords_score_zero() {
        let task_tokens = tokenize("anything at all");
        assert_eq!(keyword_match(&task_tokens, &[]), 0.0);
    }

    #[test]
    fn keyword_match_is_normalized() {
        let task_tokens = tokenize("book a flight to tokyo");
        // Keyword tokens: {flight, booking} — one of two present.
        let m = keyword_match(&task_tokens, &["flight booking".into()]);
        assert!((m - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn tokenize_folds_case_punctuation_and_plurals() {
        let tokens = tokenize("Plan Trip: FLIGHTS, hotels!");
        assert!(tokens.contains("flight"));
        assert!(tokens.contains("hotel"));
        assert!(tokens.contains("plan"));
        assert!(!tokens.contains("flights"));

        // Short words and double-s words are left alone.
        assert!(tokenize("gas pass").contains("gas"));
        assert!(tokenize("gas pass").contains("pass"));
    }
}
