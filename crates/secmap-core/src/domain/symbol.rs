use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_SYMBOL_LEN: usize = 10;

/// Ticker in the store's canonical form: uppercase letters and `.` only,
/// 1 to 10 characters. Provider share-class separators (`BRK-B`) become `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalSymbol(String);

impl CanonicalSymbol {
    /// Normalize a provider symbol into canonical form, rejecting anything
    /// that does not conform afterwards.
    pub fn normalize(input: &str) -> Result<Self, ValidationError> {
        let normalized = input.trim().to_ascii_uppercase().replace('-', ".");
        if normalized.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }

        let len = normalized.chars().count();
        if len > MAX_SYMBOL_LEN {
            return Err(ValidationError::SymbolTooLong {
                len,
                max: MAX_SYMBOL_LEN,
            });
        }

        for (index, ch) in normalized.chars().enumerate() {
            if !(ch.is_ascii_uppercase() || ch == '.') {
                return Err(ValidationError::SymbolInvalidChar { ch, index });
            }
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The symbol as the provider spells it, with `-` as the share-class separator.
    pub fn provider_symbol(&self) -> String {
        self.0.replace('.', "-")
    }
}

impl Display for CanonicalSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for CanonicalSymbol {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::normalize(&value)
    }
}

impl From<CanonicalSymbol> for String {
    fn from(value: CanonicalSymbol) -> Self {
        value.0
    }
}
