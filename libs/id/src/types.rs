//! Typed ID definitions for cluster resources.

use crate::{define_id, define_numeric_id};

// =============================================================================
// Cluster Topology
// =============================================================================

define_numeric_id!(NodeId, i32, "n");
define_numeric_id!(StoreId, i32, "s");

// =============================================================================
// Key Space
// =============================================================================

define_numeric_id!(RangeId, i64, "r");

// =============================================================================
// Membership Changes
// =============================================================================

// Generated per dispatched change so the request can be followed across logs.
define_id!(ChangeId, "chg");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_store_id_display() {
        assert_eq!(StoreId::new(12).to_string(), "s12");
        assert_eq!(NodeId::new(1).to_string(), "n1");
        assert_eq!(RangeId::new(40).to_string(), "r40");
    }

    #[test]
    fn test_store_id_parse() {
        let parsed: StoreId = "s7".parse().unwrap();
        assert_eq!(parsed, StoreId::new(7));
    }

    #[test]
    fn test_store_id_missing_prefix() {
        let result: Result<StoreId, _> = "7".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingPrefix { .. }
        ));
    }

    #[test]
    fn test_store_id_invalid_prefix() {
        let result: Result<StoreId, _> = "n7".parse();
        let err = result.unwrap_err();
        assert!(err.is_prefix_error());
        assert_eq!(
            err,
            crate::IdError::InvalidPrefix {
                expected: "s",
                actual: "n".to_string(),
            }
        );
    }

    #[test]
    fn test_store_id_invalid_number() {
        let result: Result<StoreId, _> = "sx".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidNumber(_)));
    }

    #[test]
    fn test_numeric_id_empty() {
        let result: Result<RangeId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_numeric_id_serializes_as_integer() {
        let json = serde_json::to_string(&StoreId::new(3)).unwrap();
        assert_eq!(json, "3");
        let parsed: StoreId = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, StoreId::new(3));
    }

    #[test]
    fn test_change_id_roundtrip() {
        let id = ChangeId::new();
        let s = id.to_string();
        assert!(s.starts_with("chg_"));
        let parsed: ChangeId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_change_id_missing_separator() {
        let result: Result<ChangeId, _> = "chg01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_change_id_invalid_ulid() {
        let result: Result<ChangeId, _> = "chg_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_change_id_json_roundtrip() {
        let id = ChangeId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ChangeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = vec![
            NodeId::PREFIX,
            StoreId::PREFIX,
            RangeId::PREFIX,
            ChangeId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_store_id_parse_display(value in any::<i32>()) {
            let id = StoreId::new(value);
            let parsed: StoreId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
