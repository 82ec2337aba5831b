//! Binding expressions for singleton scope ids.
//!
//! Two kinds of expression are supported:
//! - `%name%` app-setting references, resolved once through a [`NameResolver`]
//! - `{param}` references to trigger binding data, resolved per invocation

use crate::error::BindingError;
use crate::executors::BindingData;
use regex::Regex;
use std::collections::HashMap;

const PARAMETER_PATTERN: &str = r"\{([^{}]*)\}";
const SETTING_PATTERN: &str = r"%([^%]+)%";
const PARAMETER_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.]*$";

/// Resolves `%name%` references to app settings
pub trait NameResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolves names from a fixed map
#[derive(Debug, Clone, Default)]
pub struct MapNameResolver {
    values: HashMap<String, String>,
}

impl MapNameResolver {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl NameResolver for MapNameResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Resolves names from process environment variables
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentNameResolver;

impl NameResolver for EnvironmentNameResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

fn compile(pattern: &str) -> Result<Regex, BindingError> {
    Regex::new(pattern).map_err(|e| BindingError::InvalidExpression {
        expression: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Replace every `%name%` in `input` with its resolved value.
///
/// # Errors
///
/// [`BindingError::UnresolvedSetting`] when a name has no value.
pub fn resolve_settings(input: &str, resolver: &dyn NameResolver) -> Result<String, BindingError> {
    let pattern = compile(SETTING_PATTERN)?;
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for captures in pattern.captures_iter(input) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = resolver
            .resolve(name.as_str())
            .ok_or_else(|| BindingError::UnresolvedSetting {
                name: name.as_str().to_string(),
            })?;

        output.push_str(&input[last..whole.start()]);
        output.push_str(&value);
        last = whole.end();
    }

    output.push_str(&input[last..]);
    Ok(output)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Parameter(String),
}

/// A parsed `{param}` template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTemplate {
    pattern: String,
    segments: Vec<Segment>,
}

impl BindingTemplate {
    /// Parse a template.
    ///
    /// # Errors
    ///
    /// [`BindingError::InvalidExpression`] for empty or malformed parameter
    /// names and for unbalanced braces.
    pub fn parse(pattern: &str) -> Result<Self, BindingError> {
        let parameter = compile(PARAMETER_PATTERN)?;
        let name_pattern = compile(PARAMETER_NAME_PATTERN)?;
        let mut segments = Vec::new();
        let mut last = 0;

        for captures in parameter.captures_iter(pattern) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let name = name.as_str().trim();
            if !name_pattern.is_match(name) {
                return Err(BindingError::InvalidExpression {
                    expression: pattern.to_string(),
                    message: format!("'{}' is not a valid parameter name", name),
                });
            }

            Self::push_literal(&mut segments, pattern, &pattern[last..whole.start()])?;
            segments.push(Segment::Parameter(name.to_string()));
            last = whole.end();
        }

        Self::push_literal(&mut segments, pattern, &pattern[last..])?;

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    fn push_literal(
        segments: &mut Vec<Segment>,
        pattern: &str,
        literal: &str,
    ) -> Result<(), BindingError> {
        if literal.contains('{') || literal.contains('}') {
            return Err(BindingError::InvalidExpression {
                expression: pattern.to_string(),
                message: "unbalanced braces".to_string(),
            });
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal.to_string()));
        }

        Ok(())
    }

    /// The original template text
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if the template references any parameter
    pub fn has_parameters(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Parameter(_)))
    }

    /// Names of the referenced parameters, in order
    pub fn parameter_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Parameter(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Substitute binding data into the template.
    ///
    /// Parameter lookup falls back to a case-insensitive match.
    ///
    /// # Errors
    ///
    /// [`BindingError::MissingParameter`] when a parameter has no value.
    pub fn bind(&self, data: &BindingData) -> Result<String, BindingError> {
        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Parameter(name) => {
                    let value = data
                        .get(name)
                        .or_else(|| {
                            data.iter()
                                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                                .map(|(_, value)| value)
                        })
                        .ok_or_else(|| BindingError::MissingParameter {
                            parameter: name.clone(),
                        })?;
                    output.push_str(value);
                }
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
#[path = "binding_tests.rs"]
mod tests;
