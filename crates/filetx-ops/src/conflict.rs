//! Conflict policies and the injected resolver used for `ask`.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Type alias for boxed futures returned by resolvers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How a batch handles a destination name that already exists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConflictPolicy {
    /// Ask the injected resolver, once per colliding name.
    #[default]
    Ask,
    /// Place the item under the lowest free "name (n).ext".
    Rename,
    /// Leave the existing item alone and drop this one from the plan.
    Skip,
    /// Replace the existing item (after backing it up).
    Overwrite,
    /// Abort the whole batch.
    Cancel,
}

/// A resolver's answer for one colliding name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConflictChoice {
    Rename,
    Skip,
    Overwrite,
    Cancel,
}

impl ConflictPolicy {
    /// The fixed choice this policy makes, or `None` for `Ask`.
    pub fn fixed_choice(&self) -> Option<ConflictChoice> {
        match self {
            Self::Ask => None,
            Self::Rename => Some(ConflictChoice::Rename),
            Self::Skip => Some(ConflictChoice::Skip),
            Self::Overwrite => Some(ConflictChoice::Overwrite),
            Self::Cancel => Some(ConflictChoice::Cancel),
        }
    }
}

/// Decides what to do with a colliding name when the policy is `Ask`.
///
/// Implemented for plain closures returning a [`ConflictChoice`]; UI hosts
/// implement it directly to await a dialog.
pub trait ConflictResolver: Send + Sync {
    /// Resolve the collision for `file_name`.
    fn resolve<'a>(&'a self, file_name: &'a str) -> BoxFuture<'a, ConflictChoice>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&str) -> ConflictChoice + Send + Sync,
{
    fn resolve<'a>(&'a self, file_name: &'a str) -> BoxFuture<'a, ConflictChoice> {
        let choice = self(file_name);
        Box::pin(async move { choice })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_policy_parse_and_display() {
        assert_eq!(ConflictPolicy::from_str("overwrite").unwrap(), ConflictPolicy::Overwrite);
        assert_eq!(ConflictPolicy::Rename.to_string(), "rename");
        assert!(ConflictPolicy::from_str("clobber").is_err());
    }

    #[test]
    fn test_fixed_choice() {
        assert_eq!(ConflictPolicy::Ask.fixed_choice(), None);
        assert_eq!(ConflictPolicy::Skip.fixed_choice(), Some(ConflictChoice::Skip));
        assert_eq!(ConflictPolicy::Cancel.fixed_choice(), Some(ConflictChoice::Cancel));
    }

    #[tokio::test]
    async fn test_closure_resolver() {
        let resolver = |name: &str| {
            if name.ends_with(".log") {
                ConflictChoice::Skip
            } else {
                ConflictChoice::Overwrite
            }
        };
        assert_eq!(resolver.resolve("a.log").await, ConflictChoice::Skip);
        assert_eq!(resolver.resolve("a.txt").await, ConflictChoice::Overwrite);
    }
}
