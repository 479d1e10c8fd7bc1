//! Identifier newtypes for slugs, invocation ids and jobs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique name of a task or workflow definition.
    ///
    /// Task and workflow slugs share one namespace in the registry.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsuzuki_core::Slug;
    ///
    /// let slug = Slug::new("createPost");
    /// assert_eq!(slug.as_str(), "createPost");
    ///
    /// let slug: Slug = "updatePost".into();
    /// assert_eq!(slug.to_string(), "updatePost");
    /// ```
    Slug
);

string_id!(
    /// Author-chosen key identifying one task call across workflow retries.
    ///
    /// The same logical step must use the same invocation id on every run of
    /// the workflow handler, otherwise its memoized output is not found.
    InvocationId
);

/// Identifier of a job, time sortable (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh job id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Uuid>().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_conversions() {
        let a = Slug::new("createPost");
        let b: Slug = "createPost".into();
        let c: Slug = String::from("createPost").into();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.as_ref(), "createPost");
    }

    #[test]
    fn test_slug_serializes_as_plain_string() {
        let json = serde_json::to_string(&InvocationId::new("1")).unwrap();
        assert_eq!(json, "\"1\"");
    }

    #[test]
    fn test_job_id_round_trips_through_str() {
        let id = JobId::generate();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
