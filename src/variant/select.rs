use super::Variant;

/// Pick a variant for a task description.
///
/// If the text begins with a reserved keyword (`full`, `hotfix`, `tests`,
/// `docs`), that variant wins and the keyword is stripped from the text
/// handed downstream. Otherwise keyword heuristics apply, and `standard`
/// is the fallback. Never fails: no match is itself the standard result.
pub fn select(task_text: &str) -> (Variant, String) {
    let trimmed = task_text.trim();

    if let Some((variant, rest)) = strip_reserved_prefix(trimmed) {
        return (variant, rest.to_string());
    }

    (heuristic(trimmed), trimmed.to_string())
}

fn strip_reserved_prefix(text: &str) -> Option<(Variant, &str)> {
    let (first, rest) = match text.split_once(char::is_whitespace) {
        Some((f, r)) => (f, r),
        None => (text, ""),
    };
    // Allow "hotfix:" as well as "hotfix"
    let keyword = first.trim_end_matches(':').to_lowercase();
    let variant = Variant::from_keyword(&keyword)?;
    Some((variant, rest.trim_start()))
}

fn heuristic(text: &str) -> Variant {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has_word = |w: &str| words.iter().any(|x| *x == w);

    if has_word("fix") || has_word("bug") || has_word("crash") || has_word("urgent") {
        return Variant::Hotfix;
    }
    if lower.contains("new service")
        || has_word("architecture")
        || has_word("redesign")
        || has_word("migrate")
    {
        return Variant::Full;
    }
    if lower.contains("add tests") || has_word("coverage") || lower.contains("test-only") {
        return Variant::Tests;
    }
    if has_word("docs") || has_word("readme") || has_word("documentation") {
        return Variant::Docs;
    }

    Variant::Standard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefix_wins_and_is_stripped() {
        let (variant, rest) = select("hotfix payment gateway timeout");
        assert_eq!(variant, Variant::Hotfix);
        assert_eq!(rest, "payment gateway timeout");

        let (variant, rest) = select("docs: update api reference");
        assert_eq!(variant, Variant::Docs);
        assert_eq!(rest, "update api reference");

        let (variant, rest) = select("full rework the billing architecture");
        assert_eq!(variant, Variant::Full);
        assert_eq!(rest, "rework the billing architecture");
    }

    #[test]
    fn fix_keyword_selects_hotfix() {
        let (variant, rest) = select("fix: login redirect loop");
        assert_eq!(variant, Variant::Hotfix);
        assert_eq!(rest, "fix: login redirect loop");
    }

    #[test]
    fn prefix_is_not_matched_inside_words() {
        // "prefix" contains "fix" but must not trigger the hotfix heuristic
        let (variant, _) = select("support custom url prefix handling");
        assert_eq!(variant, Variant::Standard);
    }

    #[test]
    fn heuristics_cover_each_variant() {
        assert_eq!(select("urgent crash in checkout").0, Variant::Hotfix);
        assert_eq!(select("migrate sessions to redis").0, Variant::Full);
        assert_eq!(select("add tests for parser module").0, Variant::Tests);
        assert_eq!(select("improve coverage of auth flows").0, Variant::Tests);
        assert_eq!(select("update readme badges").0, Variant::Docs);
    }

    #[test]
    fn no_match_falls_back_to_standard() {
        let (variant, rest) = select("add pagination to user list");
        assert_eq!(variant, Variant::Standard);
        assert_eq!(rest, "add pagination to user list");
    }

    #[test]
    fn bare_keyword_yields_empty_task_text() {
        let (variant, rest) = select("tests");
        assert_eq!(variant, Variant::Tests);
        assert_eq!(rest, "");
    }
}
