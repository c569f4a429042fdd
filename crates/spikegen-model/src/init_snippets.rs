//! Built-in variable initialisation snippets and the process-wide snippet
//! registry.
//!
//! Behavior-bearing snippets register themselves by name so tooling can
//! enumerate them and callers can look them up without holding an `Arc`
//! through their own plumbing. The built-ins cover the distributions the
//! `$(gennrand_...)` RNG primitives provide.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex};

use crate::snippet::Snippet;

static SNIPPET_REGISTRY: LazyLock<Mutex<BTreeMap<String, Arc<Snippet>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

/// Register a snippet under its name. If a snippet with the same name is
/// already registered, the existing one wins and is returned.
pub fn register(snippet: Arc<Snippet>) -> Arc<Snippet> {
    let mut registry = SNIPPET_REGISTRY.lock().unwrap();
    registry
        .entry(snippet.name().to_string())
        .or_insert(snippet)
        .clone()
}

/// Look up a registered snippet by name.
pub fn lookup(name: &str) -> Option<Arc<Snippet>> {
    SNIPPET_REGISTRY.lock().unwrap().get(name).cloned()
}

/// Names of all registered snippets, in deterministic order.
pub fn registered_names() -> Vec<String> {
    SNIPPET_REGISTRY.lock().unwrap().keys().cloned().collect()
}

fn cached(name: &str, build: impl FnOnce() -> Arc<Snippet>) -> Arc<Snippet> {
    if let Some(snippet) = lookup(name) {
        return snippet;
    }
    register(build())
}

/// No initialisation code; the variable is copied from the host during
/// `initializeSparse`.
pub fn uninitialised() -> Arc<Snippet> {
    cached("Uninitialised", || Snippet::var_init("Uninitialised", "").build())
}

/// Initialises a variable to a constant value.
pub fn constant() -> Arc<Snippet> {
    cached("Constant", || {
        Snippet::var_init("Constant", "$(value) = $(constant);")
            .param_names(["constant"])
            .build()
    })
}

/// Initialises a variable by sampling from the uniform distribution.
pub fn uniform() -> Arc<Snippet> {
    cached("Uniform", || {
        Snippet::var_init(
            "Uniform",
            "const scalar scale = $(max) - $(min);\n$(value) = $(min) + ($(gennrand_uniform) * scale);",
        )
        .param_names(["min", "max"])
        .build()
    })
}

/// Initialises a variable by sampling from the normal distribution.
pub fn normal() -> Arc<Snippet> {
    cached("Normal", || {
        Snippet::var_init("Normal", "$(value) = $(mean) + ($(gennrand_normal) * $(sd));")
            .param_names(["mean", "sd"])
            .build()
    })
}

/// Initialises a variable by sampling from the exponential distribution.
pub fn exponential() -> Arc<Snippet> {
    cached("Exponential", || {
        Snippet::var_init("Exponential", "$(value) = $(lambda) * $(gennrand_exponential);")
            .param_names(["lambda"])
            .build()
    })
}

/// Initialises a variable by sampling from the gamma distribution.
pub fn gamma() -> Arc<Snippet> {
    cached("Gamma", || {
        Snippet::var_init("Gamma", "$(value) = $(b) * $(gennrand_gamma, $(a));")
            .param_names(["a", "b"])
            .build()
    })
}

/// Initialises a variable by sampling from the binomial distribution.
pub fn binomial() -> Arc<Snippet> {
    cached("Binomial", || {
        Snippet::var_init("Binomial", "$(value) = $(gennrand_binomial, (unsigned int)$(n), $(p));")
            .param_names(["n", "p"])
            .build()
    })
}

/// Marker snippet for connectivity copied from the host.
pub fn uninitialised_connectivity() -> Arc<Snippet> {
    cached("UninitialisedConnectivity", || {
        Snippet::sparse_connectivity("UninitialisedConnectivity", Default::default()).build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_ins_register_once() {
        let first = constant();
        let second = constant();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(lookup("Constant").is_some());
    }

    #[test]
    fn test_registered_names_sorted() {
        uniform();
        normal();
        let names = registered_names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_gamma_uses_rng_primitive() {
        let code = gamma().var_init_code().unwrap().to_string();
        assert!(code.contains("$(gennrand_gamma, $(a))"));
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(lookup("NoSuchSnippet").is_none());
    }
}
