//! Qualified handler names.
//!
//! Follows SQL identifier rules: unquoted identifiers fold to lower case,
//! double-quoted identifiers keep their case and may contain dots or spaces
//! (`""` inside quotes is a literal quote).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,

    #[error("invalid name syntax: {0}")]
    Syntax(String),

    #[error("improper qualified name (too many dotted names): {0}")]
    TooManyParts(String),
}

/// `[schema.]name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    schema: Option<String>,
    name: String,
}

impl QualifiedName {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same name, bound to `schema`.
    pub fn in_schema(&self, schema: &str) -> Self {
        Self {
            schema: Some(schema.to_string()),
            name: self.name.clone(),
        }
    }

    pub fn parse(input: &str) -> Result<Self, NameError> {
        let parts = split_identifiers(input)?;
        match parts.as_slice() {
            [name] => Ok(Self {
                schema: None,
                name: name.clone(),
            }),
            [schema, name] => Ok(Self {
                schema: Some(schema.clone()),
                name: name.clone(),
            }),
            _ => Err(NameError::TooManyParts(input.to_string())),
        }
    }
}

impl std::str::FromStr for QualifiedName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(schema) = &self.schema {
            write!(f, "{}.", quote_if_needed(schema))?;
        }
        write!(f, "{}", quote_if_needed(&self.name))
    }
}

fn quote_if_needed(ident: &str) -> String {
    let plain = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

fn split_identifiers(input: &str) -> Result<Vec<String>, NameError> {
    if input.trim().is_empty() {
        return Err(NameError::Empty);
    }

    let mut parts = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let ident = if chars.next_if_eq(&'"').is_some() {
            let mut ident = String::new();
            loop {
                match chars.next() {
                    Some('"') => {
                        if chars.next_if_eq(&'"').is_some() {
                            ident.push('"');
                        } else {
                            break;
                        }
                    }
                    Some(c) => ident.push(c),
                    None => return Err(NameError::Syntax(input.to_string())),
                }
            }
            ident
        } else {
            let mut ident = String::new();
            while let Some(c) = chars.next_if(|c| *c != '.' && !c.is_whitespace()) {
                if c == '"' {
                    return Err(NameError::Syntax(input.to_string()));
                }
                ident.push(c.to_ascii_lowercase());
            }
            ident
        };

        if ident.is_empty() {
            return Err(NameError::Syntax(input.to_string()));
        }
        parts.push(ident);

        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        match chars.next() {
            None => break,
            Some('.') => continue,
            Some(_) => return Err(NameError::Syntax(input.to_string())),
        }
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("notify", None, "notify")]
    #[case("public.notify", Some("public"), "notify")]
    #[case("Billing.Charge", Some("billing"), "charge")]
    #[case(" app . cleanup ", Some("app"), "cleanup")]
    #[case("\"App\".\"Send.Mail\"", Some("App"), "Send.Mail")]
    #[case("\"say \"\"hi\"\"\"", None, "say \"hi\"")]
    fn parses_valid_names(
        #[case] input: &str,
        #[case] schema: Option<&str>,
        #[case] name: &str,
    ) {
        let parsed = QualifiedName::parse(input).unwrap();
        assert_eq!(parsed.schema(), schema);
        assert_eq!(parsed.name(), name);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("public.")]
    #[case(".notify")]
    #[case("\"unterminated")]
    #[case("two words")]
    #[case("a.b.c")]
    fn rejects_invalid_names(#[case] input: &str) {
        assert!(QualifiedName::parse(input).is_err());
    }

    #[test]
    fn display_quotes_only_when_needed() {
        let plain = QualifiedName::parse("public.notify").unwrap();
        assert_eq!(plain.to_string(), "public.notify");

        let quoted = QualifiedName::parse("\"App\".\"Send.Mail\"").unwrap();
        assert_eq!(quoted.to_string(), "\"App\".\"Send.Mail\"");
        assert_eq!(QualifiedName::parse(&quoted.to_string()).unwrap(), quoted);
    }
}
