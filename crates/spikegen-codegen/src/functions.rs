//! Templates for generic functions user code calls through the DSL, such as
//! the `$(gennrand_...)` RNG primitives. Each backend supplies its own template
//! set; the engine picks the single- or double-precision column.

use spikegen_model::ScalarPrecision;

use crate::error::Result;
use crate::text::function_substitute;

/// How to implement one generic function, per precision.
#[derive(Debug, Clone, Copy)]
pub struct FunctionTemplate {
    /// Generic name used to refer to the function in user code.
    pub generic_name: &'static str,
    /// Number of function arguments.
    pub num_arguments: usize,
    /// Template used when the model uses double precision.
    pub double_precision_template: &'static str,
    /// Template used when the model uses single precision.
    pub single_precision_template: &'static str,
}

/// Substitute every listed generic function for the template matching the
/// model precision.
pub fn function_substitutions(
    code: &mut String,
    precision: ScalarPrecision,
    functions: &[FunctionTemplate],
) -> Result<()> {
    for function in functions {
        let template = if precision.is_single() {
            function.single_precision_template
        } else {
            function.double_precision_template
        };
        function_substitute(code, function.generic_name, function.num_arguments, template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_FUNCTIONS: [FunctionTemplate; 2] = [
        FunctionTemplate {
            generic_name: "gennrand_uniform",
            num_arguments: 0,
            double_precision_template: "curand_uniform_double($(rng))",
            single_precision_template: "curand_uniform($(rng))",
        },
        FunctionTemplate {
            generic_name: "gennrand_gamma",
            num_arguments: 1,
            double_precision_template: "gammaDistDouble($(rng), $(0))",
            single_precision_template: "gammaDistFloat($(rng), $(0))",
        },
    ];

    #[test]
    fn test_precision_selects_template() {
        let mut single = "x = $(gennrand_uniform);".to_string();
        function_substitutions(&mut single, ScalarPrecision::Single, &TEST_FUNCTIONS).unwrap();
        assert_eq!(single, "x = curand_uniform($(rng));");

        let mut double = "x = $(gennrand_uniform);".to_string();
        function_substitutions(&mut double, ScalarPrecision::Double, &TEST_FUNCTIONS).unwrap();
        assert_eq!(double, "x = curand_uniform_double($(rng));");
    }

    #[test]
    fn test_arguments_forwarded() {
        let mut code = "x = $(gennrand_gamma, $(a));".to_string();
        function_substitutions(&mut code, ScalarPrecision::Single, &TEST_FUNCTIONS).unwrap();
        assert_eq!(code, "x = gammaDistFloat($(rng), $(a));");
    }
}
