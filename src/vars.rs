//! Runtime variable environment for show/set/reset.
//!
//! Variables are typed, carry their default, and live for the process.

use std::collections::BTreeMap;

use catalog::CatalogError;

use crate::error::{BunkerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableValue {
    Bool(bool),
    Integer(i64),
    Text(String),
    Enum {
        value: String,
        allowed: Vec<&'static str>,
    },
}

impl VariableValue {
    fn type_name(&self) -> &'static str {
        match self {
            VariableValue::Bool(_) => "bool",
            VariableValue::Integer(_) => "integer",
            VariableValue::Text(_) => "string",
            VariableValue::Enum { .. } => "enum",
        }
    }

    pub fn display(&self) -> String {
        match self {
            VariableValue::Bool(v) => v.to_string(),
            VariableValue::Integer(v) => v.to_string(),
            VariableValue::Text(v) => v.clone(),
            VariableValue::Enum { value, .. } => value.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigVariable {
    pub name: &'static str,
    pub value: VariableValue,
    pub default: VariableValue,
}

/// The per-process variable environment.
pub struct VariableEnvironment {
    vars: BTreeMap<&'static str, ConfigVariable>,
}

impl Default for VariableEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableEnvironment {
    pub fn new() -> Self {
        let mut vars = BTreeMap::new();
        for var in [
            ConfigVariable {
                name: "launcher_detach",
                value: VariableValue::Bool(true),
                default: VariableValue::Bool(true),
            },
            ConfigVariable {
                name: "verbose",
                value: VariableValue::Bool(false),
                default: VariableValue::Bool(false),
            },
            ConfigVariable {
                name: "compression",
                value: VariableValue::Enum {
                    value: "none".to_string(),
                    allowed: vec!["none", "gzip", "zstd"],
                },
                default: VariableValue::Enum {
                    value: "none".to_string(),
                    allowed: vec!["none", "gzip", "zstd"],
                },
            },
            ConfigVariable {
                name: "max_rate",
                value: VariableValue::Integer(0),
                default: VariableValue::Integer(0),
            },
        ] {
            vars.insert(var.name, var);
        }
        Self { vars }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigVariable> {
        self.vars.values()
    }

    pub fn get(&self, name: &str) -> Result<&ConfigVariable> {
        self.vars.get(name).ok_or_else(|| {
            BunkerError::from(CatalogError::catalog(format!(
                "unrecognized variable \"{name}\""
            )))
        })
    }

    /// Sets a variable from its textual representation, enforcing the
    /// variable's type.
    pub fn set(&mut self, name: &str, raw: &str) -> Result<()> {
        let var = self.vars.get_mut(name).ok_or_else(|| {
            BunkerError::from(CatalogError::catalog(format!(
                "unrecognized variable \"{name}\""
            )))
        })?;

        let type_error = |expected: &str| {
            BunkerError::from(CatalogError::catalog(format!(
                "variable \"{name}\" expects a {expected} value, got \"{raw}\""
            )))
        };

        var.value = match &var.value {
            VariableValue::Bool(_) => match raw {
                "true" | "on" | "1" => VariableValue::Bool(true),
                "false" | "off" | "0" => VariableValue::Bool(false),
                _ => return Err(type_error("bool")),
            },
            VariableValue::Integer(_) => {
                VariableValue::Integer(raw.parse().map_err(|_| type_error("integer"))?)
            }
            VariableValue::Text(_) => VariableValue::Text(raw.to_string()),
            VariableValue::Enum { allowed, .. } => {
                if !allowed.contains(&raw) {
                    return Err(BunkerError::from(CatalogError::catalog(format!(
                        "variable \"{name}\" accepts one of {allowed:?}, got \"{raw}\""
                    ))));
                }
                VariableValue::Enum {
                    value: raw.to_string(),
                    allowed: allowed.clone(),
                }
            }
        };
        Ok(())
    }

    /// Resets a variable back to its default.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let var = self.vars.get_mut(name).ok_or_else(|| {
            BunkerError::from(CatalogError::catalog(format!(
                "unrecognized variable \"{name}\""
            )))
        })?;
        var.value = var.default.clone();
        Ok(())
    }

    /// Prints one variable or all of them.
    pub fn show(&self, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) => {
                let var = self.get(name)?;
                println!("{} = {} ({})", var.name, var.value.display(), var.value.type_name());
            }
            None => {
                for var in self.iter() {
                    println!("{} = {} ({})", var.name, var.value.display(), var.value.type_name());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_enforces_types() {
        let mut env = VariableEnvironment::new();
        env.set("verbose", "on").unwrap();
        assert_eq!(env.get("verbose").unwrap().value, VariableValue::Bool(true));

        assert!(env.set("verbose", "maybe").is_err());
        assert!(env.set("max_rate", "fast").is_err());
        env.set("max_rate", "2048").unwrap();

        assert!(env.set("compression", "lz4").is_err());
        env.set("compression", "zstd").unwrap();

        assert!(env.set("no_such_var", "1").is_err());
    }

    #[test]
    fn reset_restores_default() {
        let mut env = VariableEnvironment::new();
        env.set("launcher_detach", "off").unwrap();
        env.reset("launcher_detach").unwrap();
        assert_eq!(
            env.get("launcher_detach").unwrap().value,
            VariableValue::Bool(true)
        );
    }
}
