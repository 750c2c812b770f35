use crate::error::{Error, Result};

/// Table names are spliced into SQL text, so only plain identifiers pass.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "invalid table name {name:?}: use letters, digits and underscores"
        )));
    }
    if name.len() > 64 {
        return Err(Error::Config(format!("table name {name:?} too long")));
    }
    Ok(())
}
