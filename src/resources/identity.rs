use serde::{Deserialize, Serialize};

/// The caller of a request, as established by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub is_admin: bool,
    pub display_name: String,
    /// Directory id (student number) used in every remote object name.
    pub external_id: String,
    pub email: Option<String>,
}

impl Identity {
    pub fn first_name(&self) -> &str {
        self.display_name
            .split_whitespace()
            .next()
            .unwrap_or(&self.display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_name() {
        let identity = Identity {
            user_id: "u1".to_string(),
            is_admin: false,
            display_name: "Ada  Lovelace".to_string(),
            external_id: "s100".to_string(),
            email: None,
        };
        assert_eq!(identity.first_name(), "Ada");
    }
}
