//! A stack of substitution frames. Each generator layer pushes a child frame
//! holding the names it can resolve; applying a frame rewrites function
//! substitutions first, then variable substitutions, then delegates to the
//! parent frame.

use crate::error::{CodegenError, Result};
use crate::text;

#[derive(Debug, Default)]
pub struct Substitutions<'a> {
    parent: Option<&'a Substitutions<'a>>,
    var_substitutions: Vec<(String, String)>,
    func_substitutions: Vec<FuncSubstitution>,
}

#[derive(Debug)]
struct FuncSubstitution {
    name: String,
    num_args: usize,
    template: String,
}

impl<'a> Substitutions<'a> {
    pub fn new() -> Substitutions<'static> {
        Substitutions::default()
    }

    pub fn with_parent(parent: &'a Substitutions<'a>) -> Self {
        Self {
            parent: Some(parent),
            var_substitutions: Vec::new(),
            func_substitutions: Vec::new(),
        }
    }

    /// Bind `$(name)` to a replacement expression.
    pub fn add_var_substitution(&mut self, name: &str, value: impl Into<String>) {
        self.var_substitutions.push((name.to_string(), value.into()));
    }

    /// Bind `$(name, a0, ...)` to a template referencing `$(0)...$(N-1)`.
    pub fn add_func_substitution(&mut self, name: &str, num_args: usize, template: impl Into<String>) {
        self.func_substitutions.push(FuncSubstitution {
            name: name.to_string(),
            num_args,
            template: template.into(),
        });
    }

    /// Bind each parameter name to its literal value.
    pub fn add_param_value_substitutions<'n, I>(&mut self, names: I, values: &[f64])
    where
        I: IntoIterator<Item = &'n str>,
    {
        for (name, value) in names.into_iter().zip(values) {
            self.add_var_substitution(name, text::write_precise_string(*value));
        }
    }

    /// Bind each of `names` to `prefix + name + postfix`.
    pub fn add_var_name_substitutions<'n, I>(&mut self, names: I, prefix: &str, postfix: &str)
    where
        I: IntoIterator<Item = &'n str>,
    {
        for name in names {
            self.add_var_substitution(name, format!("{}{}{}", prefix, name, postfix));
        }
    }

    /// Look a variable substitution up through the frame stack.
    pub fn var_substitution(&self, name: &str) -> Option<&str> {
        self.var_substitutions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_str())
            .or_else(|| self.parent.and_then(|parent| parent.var_substitution(name)))
    }

    pub fn has_var_substitution(&self, name: &str) -> bool {
        self.var_substitution(name).is_some()
    }

    /// Look up a substitution the surrounding dispatch must have bound
    /// (`id`, `id_pre`, ...); failing to find one is a generator bug surfaced
    /// as an error rather than half-substituted output.
    pub fn required(&self, name: &str) -> Result<&str> {
        self.var_substitution(name)
            .ok_or_else(|| CodegenError::MissingSubstitution(name.to_string()))
    }

    /// Apply this frame, child first, then the parent chain.
    pub fn apply(&self, code: &mut String) -> Result<()> {
        for func in &self.func_substitutions {
            text::function_substitute(code, &func.name, func.num_args, &func.template)?;
        }
        for (name, value) in &self.var_substitutions {
            text::substitute(code, &format!("$({})", name), value);
        }
        if let Some(parent) = self.parent {
            parent.apply(code)?;
        }
        Ok(())
    }

    /// Apply, then run the unresolved-placeholder barrier.
    pub fn apply_check_unresolved(&self, code: &mut String, context: &str) -> Result<()> {
        self.apply(code)?;
        text::check_unresolved(code, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_shadows_parent() {
        let mut parent = Substitutions::new();
        parent.add_var_substitution("id", "i");
        let mut child = Substitutions::with_parent(&parent);
        child.add_var_substitution("id", "lid");

        assert_eq!(child.var_substitution("id"), Some("lid"));
        assert_eq!(parent.var_substitution("id"), Some("i"));

        let mut code = "x[$(id)]".to_string();
        child.apply(&mut code).unwrap();
        assert_eq!(code, "x[lid]");
    }

    #[test]
    fn test_parent_fallback() {
        let mut parent = Substitutions::new();
        parent.add_var_substitution("t", "t");
        let child = Substitutions::with_parent(&parent);
        assert_eq!(child.var_substitution("t"), Some("t"));
        assert!(child.var_substitution("id").is_none());
    }

    #[test]
    fn test_func_substitution_applies_before_vars() {
        let mut subs = Substitutions::new();
        subs.add_func_substitution("injectCurrent", 1, "Isyn += $(0)");
        subs.add_var_substitution("amp", "0.7");

        let mut code = "$(injectCurrent, $(amp));".to_string();
        subs.apply(&mut code).unwrap();
        assert_eq!(code, "Isyn += 0.7;");
    }

    #[test]
    fn test_required_missing_is_error() {
        let subs = Substitutions::new();
        let err = subs.required("id").unwrap_err();
        assert!(matches!(err, CodegenError::MissingSubstitution(name) if name == "id"));
    }

    #[test]
    fn test_apply_check_unresolved() {
        let mut subs = Substitutions::new();
        subs.add_var_substitution("V", "lV");
        let mut code = "$(V) += $(tau);".to_string();
        let err = subs.apply_check_unresolved(&mut code, "pop : simCode").unwrap_err();
        assert!(matches!(err, CodegenError::UnresolvedPlaceholders { .. }));
    }
}
