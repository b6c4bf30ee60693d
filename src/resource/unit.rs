use std::fmt;

/// A request for `amount` permits of the resource kind named `key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceUnit {
    key: String,
    amount: usize,
}

impl ResourceUnit {
    /// Creates a reservation request.
    #[must_use]
    pub fn new(key: impl Into<String>, amount: usize) -> Self {
        Self {
            key: key.into(),
            amount,
        }
    }

    /// The resource kind name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The number of permits requested.
    #[must_use]
    pub const fn amount(&self) -> usize {
        self.amount
    }
}

impl fmt::Display for ResourceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.amount)
    }
}
