//! The text transformers at the heart of the generator: name, value and
//! function substitution over the `$(...)` placeholder DSL, numeric literal
//! precision coercion and the unresolved-placeholder barrier.

pub use spikegen_model::utils::{substitute, write_precise_string};

use spikegen_model::ScalarPrecision;

use crate::error::{CodegenError, Result};

/// Characters that may precede (or follow) a numeric literal.
const OP: &[u8] = b"+-*/(<>= ,;\n\t";

const fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

fn is_op(c: u8) -> bool {
    OP.contains(&c)
}

/// Math functions in their double- and single-precision forms. The coercion
/// pass rewrites between the two columns, keyed on the name followed by `(`.
const MATHS_FUNCS: [(&str, &str); 56] = [
    ("cos", "cosf"),
    ("sin", "sinf"),
    ("tan", "tanf"),
    ("acos", "acosf"),
    ("asin", "asinf"),
    ("atan", "atanf"),
    ("atan2", "atan2f"),
    ("cosh", "coshf"),
    ("sinh", "sinhf"),
    ("tanh", "tanhf"),
    ("acosh", "acoshf"),
    ("asinh", "asinhf"),
    ("atanh", "atanhf"),
    ("exp", "expf"),
    ("frexp", "frexpf"),
    ("ldexp", "ldexpf"),
    ("log", "logf"),
    ("log10", "log10f"),
    ("modf", "modff"),
    ("exp2", "exp2f"),
    ("expm1", "expm1f"),
    ("ilogb", "ilogbf"),
    ("log1p", "log1pf"),
    ("log2", "log2f"),
    ("logb", "logbf"),
    ("scalbn", "scalbnf"),
    ("scalbln", "scalblnf"),
    ("pow", "powf"),
    ("sqrt", "sqrtf"),
    ("cbrt", "cbrtf"),
    ("hypot", "hypotf"),
    ("erf", "erff"),
    ("erfc", "erfcf"),
    ("tgamma", "tgammaf"),
    ("lgamma", "lgammaf"),
    ("ceil", "ceilf"),
    ("floor", "floorf"),
    ("fmod", "fmodf"),
    ("trunc", "truncf"),
    ("round", "roundf"),
    ("lround", "lroundf"),
    ("llround", "llroundf"),
    ("rint", "rintf"),
    ("lrint", "lrintf"),
    ("nearbyint", "nearbyintf"),
    ("remainder", "remainderf"),
    ("remquo", "remquof"),
    ("copysign", "copysignf"),
    ("nan", "nanf"),
    ("nextafter", "nextafterf"),
    ("nexttoward", "nexttowardf"),
    ("fdim", "fdimf"),
    ("fmax", "fmaxf"),
    ("fmin", "fminf"),
    ("fabs", "fabsf"),
    ("fma", "fmaf"),
];

/// For each `name` in `names`, replace `$(name ext)` with
/// `prefix + name + postfix`.
pub fn name_substitutions<'a, I>(code: &mut String, prefix: &str, names: I, postfix: &str, ext: &str)
where
    I: IntoIterator<Item = &'a str>,
{
    for name in names {
        substitute(
            code,
            &format!("$({}{})", name, ext),
            &format!("{}{}{}", prefix, name, postfix),
        );
    }
}

/// For each `(name, value)` pair, replace `$(name ext)` with a full-precision
/// literal representation of the value.
pub fn value_substitutions<'a, I>(code: &mut String, names: I, values: &[f64], ext: &str)
where
    I: IntoIterator<Item = &'a str>,
{
    for (name, value) in names.into_iter().zip(values) {
        substitute(
            code,
            &format!("$({}{})", name, ext),
            &write_precise_string(*value),
        );
    }
}

/// Rewrite every call `$(func_name, a1, ..., a_arity)` with `template`, whose
/// body references arguments as `$(0)`, `$(1)` and so on. Argument parsing respects
/// nested parentheses; whitespace at the top level of the argument list is
/// stripped. Zero-arity calls are matched as `$(func_name)`.
pub fn function_substitute(code: &mut String, func_name: &str, num_params: usize, template: &str) -> Result<()> {
    // With no parameters, just replace the wrapped function name with the
    // template.
    if num_params == 0 {
        substitute(code, &format!("$({})", func_name), template);
        return Ok(());
    }

    let mut params: Vec<String> = Vec::with_capacity(num_params);
    let mut current_param = String::new();

    // Match up to the comma so longer function names with the same prefix are
    // not matched.
    let func_start = format!("$({},", func_name);

    while let Some(found) = code.find(&func_start) {
        let bytes = code.as_bytes();
        let mut bracket_depth = 0usize;
        let mut replaced = false;

        let mut i = found + func_start.len();
        while i < bytes.len() {
            let c = bytes[i];
            if c == b',' && bracket_depth == 0 {
                if current_param.is_empty() {
                    return Err(CodegenError::EmptyFunctionArgument {
                        func: func_name.to_string(),
                    });
                }
                params.push(std::mem::take(&mut current_param));
            } else {
                if c == b'(' {
                    bracket_depth += 1;
                } else if c == b')' {
                    if bracket_depth > 0 {
                        bracket_depth -= 1;
                    } else {
                        if current_param.is_empty() {
                            return Err(CodegenError::EmptyFunctionArgument {
                                func: func_name.to_string(),
                            });
                        }
                        params.push(std::mem::take(&mut current_param));

                        if params.len() != num_params {
                            return Err(CodegenError::FunctionArity {
                                func: func_name.to_string(),
                                expected: num_params,
                                found: params.len(),
                            });
                        }

                        let mut replace_func = template.to_string();
                        for (p, param) in params.drain(..).enumerate() {
                            substitute(&mut replace_func, &format!("$({})", p), &param);
                        }

                        code.replace_range(found..=i, &replace_func);
                        replaced = true;
                        break;
                    }
                }

                // Skip whitespace at the top level of the argument list.
                if bracket_depth > 0 || !c.is_ascii_whitespace() {
                    current_param.push(c as char);
                }
            }
            i += 1;
        }

        if !replaced {
            return Err(CodegenError::UnterminatedFunctionCall {
                func: func_name.to_string(),
            });
        }
    }

    Ok(())
}

/// Substitute math function names for the form matching `precision`.
fn ensure_math_function_ftype(code: &mut String, precision: ScalarPrecision) {
    if precision.is_single() {
        for (double_name, single_name) in MATHS_FUNCS {
            substitute(code, &format!("{}(", double_name), &format!("{}(", single_name));
        }
    } else {
        for (double_name, single_name) in MATHS_FUNCS {
            substitute(code, &format!("{}(", single_name), &format!("{}(", double_name));
        }
    }
}

/// Coerce one floating point literal ending at `i`: append the `f` suffix for
/// single precision, or strip it for double. Resets the scanner state from
/// the character now at `i`.
fn do_final(code: &mut Vec<u8>, i: usize, precision: ScalarPrecision, state: &mut u32) {
    if code[i] == b'f' {
        if matches!(precision, ScalarPrecision::Double) {
            code.remove(i);
        }
    } else if precision.is_single() {
        code.insert(i, b'f');
    }
    if i < code.len() - 1 {
        if is_op(code[i]) {
            *state = 1;
        } else {
            *state = 0;
        }
    }
}

/// Convert every floating point constant in a code snippet to a constant with
/// an explicit precision, by appending `f` or removing it. Integer-looking
/// tokens are never touched. A companion pass renames math functions to their
/// matching precision forms.
pub fn ensure_ftype(oldcode: &str, precision: ScalarPrecision) -> String {
    let mut code: Vec<u8> = oldcode.as_bytes().to_vec();
    let mut i = 0usize;
    // Allowed to start with a number straight away.
    let mut state: u32 = 1;
    while i < code.len() {
        let c = code[i];
        match state {
            // Looking for a valid lead-in.
            0 => {
                if is_op(c) {
                    state = 1;
                }
            }
            // Looking for the start of a number.
            1 => {
                if is_digit(c) {
                    state = 2;
                } else if c == b'.' {
                    state = 3;
                } else if !is_op(c) {
                    state = 0;
                }
            }
            // In a number: more digits, '.', 'e'/'E', or the end of it.
            2 => {
                if c == b'.' {
                    state = 3;
                } else if c == b'e' || c == b'E' {
                    state = 4;
                } else if !is_digit(c) {
                    // The number looks like an integer; leave it alone.
                    state = if is_op(c) { 1 } else { 0 };
                }
            }
            // Seen '.': digits or 'e'/'E' continue the literal.
            3 => {
                if c == b'e' || c == b'E' {
                    state = 4;
                } else if !is_digit(c) {
                    do_final(&mut code, i, precision, &mut state);
                }
            }
            // Seen the exponent marker: digits or a sign.
            4 => {
                if is_digit(c) {
                    state = 6;
                } else if c == b'+' || c == b'-' {
                    state = 5;
                } else {
                    state = if is_op(c) { 1 } else { 0 };
                }
            }
            // Seen the exponent sign: one or more digits, or else bail.
            5 => {
                if is_digit(c) {
                    state = 6;
                } else {
                    state = if is_op(c) { 1 } else { 0 };
                }
            }
            // Exponent digits: any non-digit terminates the literal.
            _ => {
                if !is_digit(c) {
                    do_final(&mut code, i, precision, &mut state);
                }
            }
        }
        i += 1;
    }
    if (state == 3 || state == 6) && precision.is_single() {
        code.push(b'f');
    }

    let mut code = String::from_utf8(code).expect("literal coercion only inserts or removes ASCII");
    ensure_math_function_ftype(&mut code, precision);
    code
}

/// The correctness barrier: fail if any `$(word)` placeholder survived the
/// substitution passes, enumerating the residue.
pub fn check_unresolved(code: &str, context: &str) -> Result<()> {
    let bytes = code.as_bytes();
    let mut variables = Vec::new();
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'(' {
            let start = i + 2;
            let mut end = start;
            while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                end += 1;
            }
            if end > start && end < bytes.len() && bytes[end] == b')' {
                variables.push(code[start..end].to_string());
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }

    if variables.is_empty() {
        Ok(())
    } else {
        Err(CodegenError::UnresolvedPlaceholders {
            context: context.to_string(),
            variables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_ftype_single_precision() {
        assert_eq!(
            ensure_ftype("x = 1.5 + 2e-3 + 3;", ScalarPrecision::Single),
            "x = 1.5f + 2e-3f + 3;"
        );
    }

    #[test]
    fn test_ensure_ftype_double_precision() {
        assert_eq!(
            ensure_ftype("x = 1.5f + 2.0;", ScalarPrecision::Double),
            "x = 1.5 + 2.0;"
        );
    }

    #[test]
    fn test_ensure_ftype_trailing_literal() {
        assert_eq!(ensure_ftype("x = 0.5", ScalarPrecision::Single), "x = 0.5f");
        assert_eq!(ensure_ftype("x = 1e3", ScalarPrecision::Single), "x = 1e3f");
    }

    #[test]
    fn test_ensure_ftype_integer_at_end_passes_through() {
        assert_eq!(ensure_ftype("3", ScalarPrecision::Single), "3");
        assert_eq!(ensure_ftype("x = 3", ScalarPrecision::Single), "x = 3");
    }

    #[test]
    fn test_ensure_ftype_idempotent() {
        let inputs = [
            "x = 1.5 + 2e-3 + 3;",
            "$(V) += 0.5 * exp(-$(V) / 20.0);",
            "y = .25 + 1.0E+2;",
        ];
        for input in inputs {
            for precision in [ScalarPrecision::Single, ScalarPrecision::Double] {
                let once = ensure_ftype(input, precision);
                let twice = ensure_ftype(&once, precision);
                assert_eq!(once, twice, "not idempotent on {:?}", input);
            }
        }
    }

    #[test]
    fn test_ensure_ftype_non_interference() {
        let input = "int i = idx + 42; foo(bar);";
        assert_eq!(ensure_ftype(input, ScalarPrecision::Single), input);
        assert_eq!(ensure_ftype(input, ScalarPrecision::Double), input);
    }

    #[test]
    fn test_ensure_ftype_identifier_with_digits_untouched() {
        // x2e3 is an identifier, not a literal.
        assert_eq!(ensure_ftype("y = x2e3;", ScalarPrecision::Single), "y = x2e3;");
    }

    #[test]
    fn test_math_function_coercion() {
        assert_eq!(
            ensure_ftype("y = exp(x) + pow(a, b);", ScalarPrecision::Single),
            "y = expf(x) + powf(a, b);"
        );
        assert_eq!(
            ensure_ftype("y = expf(x) + powf(a, b);", ScalarPrecision::Double),
            "y = exp(x) + pow(a, b);"
        );
        // acos must survive the cos rewrite.
        assert_eq!(ensure_ftype("y = acos(x);", ScalarPrecision::Single), "y = acosf(x);");
    }

    #[test]
    fn test_function_substitute_nested_args() {
        let mut code = "y = $(scale, $(mul, a, b), 0.5);".to_string();
        function_substitute(&mut code, "scale", 2, "(($(0)) * ($(1)))").unwrap();
        assert_eq!(code, "y = (($(mul, a, b)) * (0.5));");
    }

    #[test]
    fn test_function_substitute_strips_top_level_whitespace() {
        let mut code = "$(add,  a ,  f( b, c ));".to_string();
        function_substitute(&mut code, "add", 2, "$(0) + $(1)").unwrap();
        assert_eq!(code, "a + f( b, c );");
    }

    #[test]
    fn test_function_substitute_zero_arity() {
        let mut code = "x = $(rand);".to_string();
        function_substitute(&mut code, "rand", 0, "curand_uniform(&rng)").unwrap();
        assert_eq!(code, "x = curand_uniform(&rng);");
    }

    #[test]
    fn test_function_substitute_prefix_not_matched() {
        // $(addToInSynDelay, ...) must not be eaten by the addToInSyn rule.
        let mut code = "$(addToInSynDelay, x, d);".to_string();
        function_substitute(&mut code, "addToInSyn", 1, "inSyn += $(0)").unwrap();
        assert_eq!(code, "$(addToInSynDelay, x, d);");
    }

    #[test]
    fn test_function_substitute_wrong_arity() {
        let mut code = "$(add, a);".to_string();
        let err = function_substitute(&mut code, "add", 2, "$(0) + $(1)").unwrap_err();
        assert!(matches!(err, CodegenError::FunctionArity { expected: 2, found: 1, .. }));
    }

    #[test]
    fn test_function_substitute_unterminated() {
        let mut code = "$(add, a, b".to_string();
        let err = function_substitute(&mut code, "add", 2, "$(0) + $(1)").unwrap_err();
        assert!(matches!(err, CodegenError::UnterminatedFunctionCall { .. }));
    }

    #[test]
    fn test_value_substitutions_leave_nothing() {
        let mut code = "$(V) = $(Vreset); if ($(V) > $(Vthresh)) {}".to_string();
        value_substitutions(&mut code, ["Vreset", "Vthresh"], &[-60.0, -55.0], "");
        assert_eq!(code, "$(V) = -60.0; if ($(V) > -55.0) {}");
        assert!(!code.contains("$(Vreset)"));
        assert!(!code.contains("$(Vthresh)"));
    }

    #[test]
    fn test_name_substitutions_with_ext() {
        let mut code = "x = $(V_pre);".to_string();
        name_substitutions(&mut code, "dd_", ["V"], "PopA[preInd]", "_pre");
        assert_eq!(code, "x = dd_VPopA[preInd];");
    }

    #[test]
    fn test_check_unresolved_clean() {
        assert!(check_unresolved("x = lV + 1.0f;", "pop : simCode").is_ok());
    }

    #[test]
    fn test_check_unresolved_reports_residue() {
        let err = check_unresolved("x = $(V) + $(tau);", "pop : simCode").unwrap_err();
        match err {
            CodegenError::UnresolvedPlaceholders { variables, context } => {
                assert_eq!(variables, ["V", "tau"]);
                assert_eq!(context, "pop : simCode");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_check_unresolved_ignores_function_calls() {
        // A leftover function call is not a word placeholder; the arity-aware
        // passes are responsible for those.
        assert!(check_unresolved("$(addToInSyn, x)", "sg : simCode").is_ok());
    }
}
