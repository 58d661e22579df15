//! Macros for defining typed ID types.

/// Macro to define a typed opaque ID with a specific prefix.
///
/// This generates a newtype wrapper around a random (v4) UUID with:
/// - A `PREFIX` constant
/// - `new()` to generate a fresh ID from the OS random source
/// - `parse()` to parse from the prefixed string form
/// - `from_u128()` / `as_u128()` for the raw 128-bit wire form
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Eq` and `Hash` (value semantics only)
///
/// # Example
///
/// ```ignore
/// define_id!(ClientId, "client");
///
/// let id = ClientId::new();
/// let parsed: ClientId = id.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// An opaque 128-bit identifier.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID from the secure random source.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Creates an ID from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Creates an ID from its 128-bit wire value.
            ///
            /// The all-zero value is never issued and is rejected.
            pub fn from_u128(value: u128) -> Result<Self, $crate::IdError> {
                if value == 0 {
                    return Err($crate::IdError::Nil);
                }
                Ok(Self($crate::Uuid::from_u128(value)))
            }

            /// Returns the 128-bit wire value.
            #[must_use]
            pub fn as_u128(&self) -> u128 {
                self.0.as_u128()
            }

            /// Parses an ID from a string.
            ///
            /// The string must be in the format `{prefix}_{uuid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, uuid_str)) = s.split_once('_') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                let uuid = uuid_str
                    .parse::<$crate::Uuid>()
                    .map_err(|e| $crate::IdError::InvalidUuid(e.to_string()))?;

                if uuid.is_nil() {
                    return Err($crate::IdError::Nil);
                }

                Ok(Self(uuid))
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

        impl AsRef<$crate::Uuid> for $name {
            fn as_ref(&self) -> &$crate::Uuid {
                &self.0
            }
        }
    };
}
