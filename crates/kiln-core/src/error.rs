//! Error taxonomy.
//!
//! Structural errors come from graph construction, shape errors from
//! validation and finalization, resource errors from allocation, and usage
//! errors from calling the API out of order. None of them are retried.

/// Errors produced anywhere in the engine.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    /// Malformed graph connectivity, detected when nodes or edges are added.
    #[error("structural error: {0}")]
    Structural(String),

    /// Incompatible shapes, data types or layouts.
    #[error("shape error: {0}")]
    Shape(String),

    /// Allocation failure or insufficient scratch budget.
    #[error("resource error: {0}")]
    Resource(String),

    /// The API was driven out of order (run before configure, mutate after finalize, ...).
    #[error("usage error: {0}")]
    Usage(String),

    /// A failure attributed to a specific graph node.
    #[error("node {id} ({name}): {source}")]
    Node {
        id: u32,
        name: String,
        #[source]
        source: Box<KilnError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KilnError {
    pub fn structural(msg: impl Into<String>) -> Self {
        KilnError::Structural(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        KilnError::Shape(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        KilnError::Resource(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        KilnError::Usage(msg.into())
    }

    /// Attribute this error to a node. Already-attributed errors are kept as is.
    pub fn at_node(self, id: u32, name: &str) -> Self {
        match self {
            e @ KilnError::Node { .. } => e,
            other => KilnError::Node {
                id,
                name: name.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Whether this is (or wraps) a shape error.
    pub fn is_shape(&self) -> bool {
        match self {
            KilnError::Shape(_) => true,
            KilnError::Node { source, .. } => source.is_shape(),
            _ => false,
        }
    }

    /// Whether this is (or wraps) a usage error.
    pub fn is_usage(&self) -> bool {
        match self {
            KilnError::Usage(_) => true,
            KilnError::Node { source, .. } => source.is_usage(),
            _ => false,
        }
    }

    /// Whether this is (or wraps) a structural error.
    pub fn is_structural(&self) -> bool {
        match self {
            KilnError::Structural(_) => true,
            KilnError::Node { source, .. } => source.is_structural(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_attribution() {
        let err = KilnError::shape("rank mismatch").at_node(3, "conv1");
        assert!(err.is_shape());
        assert_eq!(err.to_string(), "node 3 (conv1): shape error: rank mismatch");

        // Re-attributing keeps the innermost node.
        let err = err.at_node(9, "other");
        assert_eq!(err.to_string(), "node 3 (conv1): shape error: rank mismatch");
    }

    #[test]
    fn test_categories() {
        assert!(KilnError::usage("x").is_usage());
        assert!(KilnError::structural("x").is_structural());
        assert!(!KilnError::resource("x").is_shape());
    }
}
