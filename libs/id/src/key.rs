//! Namespace-qualified job keys.

use crate::KeyError;

/// Separator between namespace and name in the canonical key form.
const SEPARATOR: char = '/';

/// Identity of a job: its namespace and name.
///
/// The canonical string form is `{namespace}/{name}`. Both parts are
/// guaranteed non-empty and neither contains the separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    namespace: String,
    name: String,
}

impl JobKey {
    /// Builds a key from its parts, validating both.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        let name = name.into();

        if namespace.is_empty() && name.is_empty() {
            return Err(KeyError::Empty);
        }
        if namespace.is_empty() {
            return Err(KeyError::MissingNamespace {
                key: format!("{SEPARATOR}{name}"),
            });
        }
        if name.is_empty() {
            return Err(KeyError::MissingName {
                key: format!("{namespace}{SEPARATOR}"),
            });
        }
        if namespace.contains(SEPARATOR) || name.contains(SEPARATOR) {
            return Err(KeyError::InvalidFormat {
                key: format!("{namespace}{SEPARATOR}{name}"),
            });
        }

        Ok(Self { namespace, name })
    }

    /// Parses a key from its canonical `{namespace}/{name}` form.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }

        let Some((namespace, name)) = s.split_once(SEPARATOR) else {
            // A bare name is a cluster-scoped key, which jobs never have.
            return Err(KeyError::MissingNamespace { key: s.to_string() });
        };

        if name.contains(SEPARATOR) {
            return Err(KeyError::InvalidFormat { key: s.to_string() });
        }
        if namespace.is_empty() {
            return Err(KeyError::MissingNamespace { key: s.to_string() });
        }
        if name.is_empty() {
            return Err(KeyError::MissingName { key: s.to_string() });
        }

        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Returns the namespace part.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the name part.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Splits the key into `(namespace, name)`.
    pub fn into_parts(self) -> (String, String) {
        (self.namespace, self.name)
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.namespace, SEPARATOR, self.name)
    }
}

impl std::str::FromStr for JobKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for JobKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for JobKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
