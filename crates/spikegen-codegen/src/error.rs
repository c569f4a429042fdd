//! Error types for code generation.

/// Result type for code generation operations.
pub type Result<T> = std::result::Result<T, CodegenError>;

/// Errors raised while transforming snippet code or emitting kernels.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The correctness barrier: a code string reached emission with
    /// placeholders nobody resolved.
    #[error("{}", unresolved_message(.context, .variables))]
    UnresolvedPlaceholders { context: String, variables: Vec<String> },

    #[error("function '$({func}, ...)' expects {expected} arguments, found {found}")]
    FunctionArity {
        func: String,
        expected: usize,
        found: usize,
    },

    #[error("function '$({func}, ...)' has an empty argument")]
    EmptyFunctionArgument { func: String },

    #[error("unterminated call to '$({func}, ...)'")]
    UnterminatedFunctionCall { func: String },

    #[error("no substitution bound for '$({0})'")]
    MissingSubstitution(String),

    #[error("no presynaptic update strategy is compatible with synapse group '{0}'")]
    NoCompatibleStrategy(String),

    #[error("unsupported backend capability: {0}")]
    UnsupportedBackendCapability(String),

    #[error(transparent)]
    Model(#[from] spikegen_model::ModelError),
}

fn unresolved_message(context: &str, variables: &[String]) -> String {
    let list = variables.join(", ");
    if variables.len() > 1 {
        format!("variables {} were undefined in code {}", list, context)
    } else {
        format!("variable {} was undefined in code {}", list, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_message_singular_plural() {
        let one = CodegenError::UnresolvedPlaceholders {
            context: "pop : simCode".to_string(),
            variables: vec!["V".to_string()],
        };
        assert_eq!(one.to_string(), "variable V was undefined in code pop : simCode");

        let two = CodegenError::UnresolvedPlaceholders {
            context: "pop : simCode".to_string(),
            variables: vec!["V".to_string(), "U".to_string()],
        };
        assert_eq!(two.to_string(), "variables V, U were undefined in code pop : simCode");
    }
}
