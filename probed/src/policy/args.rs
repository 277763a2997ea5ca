use serde::Deserialize;

/// One argument description from a probe spec (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ArgSpec {
    pub index: i32,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub resolve: Option<String>,
    #[serde(default, rename = "sizeArgIndex")]
    pub size_arg_index: Option<i32>,
    #[serde(default, rename = "returnCopy")]
    pub return_copy: bool,
    #[serde(default, rename = "maxData")]
    pub max_data: bool,
    #[serde(default)]
    pub label: Option<String>,
}

/// Positional argument limit (spec.md §8.10).
pub const MAX_ARG_INDEX: i32 = 4;

impl ArgSpec {
    /// Structural validation independent of BTF/type-registry lookups:
    /// the positional-index bound from spec.md §8.10.
    pub fn validate_index(&self) -> Result<(), String> {
        if self.index < 0 || self.index > MAX_ARG_INDEX {
            return Err(format!(
                "args[].index {} out of range 0..={MAX_ARG_INDEX}",
                self.index
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_index_beyond_positional_limit() {
        let arg = ArgSpec {
            index: 5,
            ty: "int".into(),
            resolve: None,
            size_arg_index: None,
            return_copy: false,
            max_data: false,
            label: None,
        };
        assert!(arg.validate_index().is_err());
    }

    #[test]
    fn accepts_boundary_index() {
        let arg = ArgSpec {
            index: MAX_ARG_INDEX,
            ty: "int".into(),
            resolve: None,
            size_arg_index: None,
            return_copy: false,
            max_data: false,
            label: None,
        };
        assert!(arg.validate_index().is_ok());
    }
}
