//! Macros for defining typed numeric IDs.

/// Macro to define a typed numeric ID with a specific prefix.
///
/// This generates a newtype wrapper around an unsigned integer with:
/// - A `PREFIX` constant
/// - `new()` / `value()` conversions
/// - `parse()` accepting `{prefix}_{n}` or a bare `n`
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` as a plain number
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_numeric_id!(ActorId, u64, "actor");
///
/// let id = ActorId::new(7);
/// assert_eq!(id.to_string(), "actor_7");
/// let parsed: ActorId = "actor_7".parse()?;
/// ```
#[macro_export]
macro_rules! define_numeric_id {
    ($name:ident, $repr:ty, $prefix:literal) => {
        /// A typed numeric ID.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($repr);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates an ID from its raw value.
            #[must_use]
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn value(&self) -> $repr {
                self.0
            }

            /// Parses an ID from a string.
            ///
            /// Accepts `{prefix}_{n}` or a bare `n`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let digits = match s.split_once('_') {
                    Some((prefix, rest)) => {
                        if prefix != Self::PREFIX {
                            return Err($crate::IdError::InvalidPrefix {
                                expected: Self::PREFIX,
                                actual: prefix.to_string(),
                            });
                        }
                        rest
                    }
                    None => s,
                };

                digits
                    .parse::<$repr>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidNumber(e.to_string()))
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
                <$repr as serde::Serialize>::serialize(&self.0, serializer)
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
