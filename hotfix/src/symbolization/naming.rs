//! Detection of compiler-synthesized function names
//!
//! Closures get per-build identities (`{{closure}}`, `{closure#0}`, or a
//! trailing `funcN` / `funcN.M` segment depending on the compiler), so a
//! name that survives one rebuild is not guaranteed to mean the same code in
//! the patch module. Those names are never offered as patch targets.

/// Rust demangled-name markers of synthesized code
const SYNTHESIZED_MARKERS: &[&str] = &["{{closure}}", "{closure#", "{{constant}}", "{constant#"];

/// Returns true if `name` names compiler-generated code
#[must_use]
pub fn is_synthesized(name: &str) -> bool {
    SYNTHESIZED_MARKERS.iter().any(|marker| name.contains(marker)) || has_closure_suffix(name)
}

/// Matches a trailing `funcN` segment optionally followed by `.M` segments,
/// e.g. `pkg.Handler.func1` or `pkg.(*T).Run.func2.1`
fn has_closure_suffix(name: &str) -> bool {
    let segments: Vec<&str> = name.split('.').collect();

    segments.iter().enumerate().skip(1).any(|(idx, segment)| {
        segment.strip_prefix("func").is_some_and(is_number)
            && segments[idx + 1..].iter().all(|rest| is_number(rest))
    })
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
