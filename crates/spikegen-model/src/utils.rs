//! Small string helpers shared by the model and the code generator.

/// Replace every occurrence of `target` in `code` with `replacement`.
///
/// Replacement restarts from the beginning of the buffer after each hit, so a
/// replacement that itself contains `target` must not be used (it would never
/// terminate). Snippet substitutions never do.
pub fn substitute(code: &mut String, target: &str, replacement: &str) {
    while let Some(found) = code.find(target) {
        code.replace_range(found..found + target.len(), replacement);
    }
}

/// Does a code string use any of the `$(gennrand_...)` RNG primitives?
pub fn is_rng_required(code: &str) -> bool {
    code.contains("$(gennrand")
}

/// Write a floating point value so that no digits are lost on round-trip.
///
/// Integral values keep a trailing `.0` so the literal stays a floating point
/// literal for the downstream precision coercion pass.
pub fn write_precise_string(value: f64) -> String {
    format!("{:?}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_replaces_all() {
        let mut code = "$(a) + $(a) * $(b)".to_string();
        substitute(&mut code, "$(a)", "x");
        assert_eq!(code, "x + x * $(b)");
    }

    #[test]
    fn test_substitute_no_match() {
        let mut code = "nothing here".to_string();
        substitute(&mut code, "$(a)", "x");
        assert_eq!(code, "nothing here");
    }

    #[test]
    fn test_is_rng_required() {
        assert!(is_rng_required("$(value) = $(gennrand_uniform);"));
        assert!(is_rng_required("$(gennrand_gamma, $(a))"));
        assert!(!is_rng_required("$(value) = $(constant);"));
    }

    #[test]
    fn test_write_precise_string_round_trips() {
        assert_eq!(write_precise_string(0.7), "0.7");
        assert_eq!(write_precise_string(1.0), "1.0");
        assert_eq!(write_precise_string(-0.25), "-0.25");

        let tricky = 0.1 + 0.2;
        let text = write_precise_string(tricky);
        assert_eq!(text.parse::<f64>().unwrap(), tricky);
    }
}
