//! Macros for defining typed ID types.

/// Define a locally generated, time-sortable ID rendered as
/// `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(ChangeId, "chg");
///
/// let id = ChangeId::new();
/// let parsed: ChangeId = "chg_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh ID stamped with the current time.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Parse `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let (prefix, body) = s
                    .split_once('_')
                    .ok_or($crate::IdError::MissingSeparator)?;
                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                body.parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Macro to define a cluster-assigned numeric ID with a display prefix.
///
/// The value is carried as-is on the wire (serialized as a plain integer)
/// and rendered as `{prefix}{value}` in logs and on the command line.
///
/// # Example
///
/// ```ignore
/// define_numeric_id!(StoreId, i32, "s");
///
/// let store_id = StoreId::new(3);
/// assert_eq!(store_id.to_string(), "s3");
/// let parsed: StoreId = "s3".parse()?;
/// ```
#[macro_export]
macro_rules! define_numeric_id {
    ($name:ident, $repr:ty, $prefix:literal) => {
        /// A cluster-assigned numeric ID.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            /// The display prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates an ID from its raw value.
            #[must_use]
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            /// Returns the underlying value.
            #[must_use]
            pub const fn value(&self) -> $repr {
                self.0
            }

            /// Parses an ID from its `{prefix}{value}` form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some(digits) = s.strip_prefix(Self::PREFIX) else {
                    let actual: String = s.chars().take_while(|c| !c.is_ascii_digit()).collect();
                    if actual.is_empty() {
                        return Err($crate::IdError::MissingPrefix {
                            expected: Self::PREFIX,
                            actual: s.to_string(),
                        });
                    }
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual,
                    });
                };

                digits
                    .parse::<$repr>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidNumber(format!("{s}: {e}")))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $repr {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serde::Serialize::serialize(&self.0, serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                <$repr as serde::Deserialize>::deserialize(deserializer).map(Self)
            }
        }
    };
}
