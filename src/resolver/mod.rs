//! Turns a user-supplied instance reference into concrete targets.
//!
//! Instance ids are looked up directly and never consult the picker, so the
//! same id in the same region always yields the same target. Names are
//! matched exactly, then by case-insensitive substring. When a name is
//! ambiguous or no identifier is given, an injected [`FuzzyPicker`] chooses;
//! non-interactive callers get [`OpsError::Ambiguous`] or
//! [`OpsError::IdentifierRequired`] instead.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{BackendError, Inventory};
use crate::error::OpsError;
use crate::target::{TagFilter, Target, is_instance_id};

/// Result of asking the picker to choose.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PickOutcome {
    /// The operator chose this target.
    Chosen(Target),
    /// The operator dismissed the picker.
    Cancelled,
}

/// Interactive fuzzy-match collaborator.
///
/// `pick` blocks while a human chooses, so the resolver runs it on the
/// blocking thread pool and only when [`FuzzyPicker::is_interactive`]
/// returns `true`.
pub trait FuzzyPicker: Send + Sync {
    /// Whether a human is available to choose.
    fn is_interactive(&self) -> bool;

    /// Offers `candidates` and returns the choice.
    fn pick(&self, candidates: &[Target], filter: Option<&TagFilter>) -> PickOutcome;
}

/// Picker for batch callers; never interactive.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonInteractivePicker;

impl FuzzyPicker for NonInteractivePicker {
    fn is_interactive(&self) -> bool {
        false
    }

    fn pick(&self, _candidates: &[Target], _filter: Option<&TagFilter>) -> PickOutcome {
        PickOutcome::Cancelled
    }
}

/// Why a fleet selection came back empty.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NoMatches {
    /// Region searched.
    pub region: String,
    /// Filter that matched nothing.
    pub filter: String,
}

/// Output of [`InstanceResolver::select`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Selection {
    /// A single resolved target.
    One(Target),
    /// Every target matching a tag filter, for fan-out operations.
    Fleet {
        /// Matching targets, possibly empty.
        targets: Vec<Target>,
        /// Present when nothing matched.
        warning: Option<NoMatches>,
    },
}

impl Selection {
    /// Flattens the selection into a target list.
    #[must_use]
    pub fn into_targets(self) -> Vec<Target> {
        match self {
            Self::One(target) => vec![target],
            Self::Fleet { targets, .. } => targets,
        }
    }
}

/// Resolves identifiers against an [`Inventory`].
#[derive(Clone)]
pub struct InstanceResolver {
    inventory: Arc<dyn Inventory>,
    picker: Arc<dyn FuzzyPicker>,
}

impl InstanceResolver {
    /// Creates a resolver over `inventory` with `picker` as the fallback.
    #[must_use]
    pub fn new(inventory: Arc<dyn Inventory>, picker: Arc<dyn FuzzyPicker>) -> Self {
        Self { inventory, picker }
    }

    /// Resolves one or many targets.
    ///
    /// An empty identifier with a filter yields the whole matching fleet;
    /// anything else resolves exactly one target.
    ///
    /// # Errors
    ///
    /// See [`InstanceResolver::select_one`].
    pub async fn select(
        &self,
        identifier: &str,
        region: &str,
        filter: Option<&TagFilter>,
    ) -> Result<Selection, OpsError> {
        match filter {
            Some(tags) if identifier.trim().is_empty() => self.select_fleet(region, tags).await,
            _ => self
                .select_one(identifier, region, filter)
                .await
                .map(Selection::One),
        }
    }

    /// Resolves exactly one reachable target.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::NotFound`] when nothing reachable matches,
    /// [`OpsError::Ambiguous`] or [`OpsError::IdentifierRequired`] when a
    /// choice is needed but the picker is not interactive, and
    /// [`OpsError::Cancelled`] when the operator dismisses the picker.
    pub async fn select_one(
        &self,
        identifier: &str,
        region: &str,
        filter: Option<&TagFilter>,
    ) -> Result<Target, OpsError> {
        let trimmed = identifier.trim();
        if is_instance_id(trimmed) {
            return self.by_id(trimmed, region).await;
        }
        if trimmed.is_empty() {
            if !self.picker.is_interactive() {
                return Err(OpsError::IdentifierRequired);
            }
            let candidates = self.reachable(region, filter).await?;
            if candidates.is_empty() {
                return Err(OpsError::NotFound {
                    identifier: filter.map_or_else(|| String::from("*"), ToString::to_string),
                    region: region.to_owned(),
                });
            }
            return self.choose(candidates, filter).await;
        }
        self.by_name(trimmed, region, filter).await
    }

    /// Returns every target matching `filter`, reachable or not.
    ///
    /// An empty result is logged as a warning and returned, not raised.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::CredentialInvalid`] or [`OpsError::ControlPlane`]
    /// when the inventory cannot be listed.
    pub async fn select_fleet(
        &self,
        region: &str,
        filter: &TagFilter,
    ) -> Result<Selection, OpsError> {
        let targets = self
            .inventory
            .list(region, Some(filter))
            .await
            .map_err(|err| inventory_error(err, region))?;
        let warning = targets.is_empty().then(|| {
            warn!(region, filter = %filter, "tag filter matched no instances");
            NoMatches {
                region: region.to_owned(),
                filter: filter.to_string(),
            }
        });
        Ok(Selection::Fleet { targets, warning })
    }

    async fn by_id(&self, id: &str, region: &str) -> Result<Target, OpsError> {
        let described = self
            .inventory
            .describe(region, id)
            .await
            .map_err(|err| inventory_error(err, region))?;
        match described {
            Some(target) if target.is_reachable() => Ok(target),
            Some(target) => {
                debug!(target = %target, agent = ?target.agent, "instance is not reachable");
                Err(not_found(id, region))
            }
            None => Err(not_found(id, region)),
        }
    }

    async fn by_name(
        &self,
        name: &str,
        region: &str,
        filter: Option<&TagFilter>,
    ) -> Result<Target, OpsError> {
        let candidates = self.reachable(region, filter).await?;

        let exact = candidates
            .iter()
            .filter(|target| target.name == name)
            .cloned()
            .collect::<Vec<_>>();
        let matches = if exact.is_empty() {
            let needle = name.to_lowercase();
            candidates
                .into_iter()
                .filter(|target| target.name.to_lowercase().contains(&needle))
                .collect()
        } else {
            exact
        };

        if matches.len() > 1 && self.picker.is_interactive() {
            return self.choose(matches, filter).await;
        }
        match matches.as_slice() {
            [] => Err(not_found(name, region)),
            [only] => Ok(only.clone()),
            _ => Err(OpsError::Ambiguous {
                identifier: name.to_owned(),
                candidates: matches.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    async fn reachable(
        &self,
        region: &str,
        filter: Option<&TagFilter>,
    ) -> Result<Vec<Target>, OpsError> {
        let listed = self
            .inventory
            .list(region, filter)
            .await
            .map_err(|err| inventory_error(err, region))?;
        Ok(listed
            .into_iter()
            .filter(Target::is_reachable)
            .collect())
    }

    async fn choose(
        &self,
        candidates: Vec<Target>,
        filter: Option<&TagFilter>,
    ) -> Result<Target, OpsError> {
        let picker = Arc::clone(&self.picker);
        let shown = filter.cloned();
        let outcome =
            tokio::task::spawn_blocking(move || picker.pick(&candidates, shown.as_ref())).await;
        match outcome {
            Ok(PickOutcome::Chosen(target)) => Ok(target),
            Ok(PickOutcome::Cancelled) => Err(OpsError::Cancelled),
            Err(err) => {
                warn!(error = %err, "picker did not return a choice");
                Err(OpsError::Cancelled)
            }
        }
    }
}

fn not_found(identifier: &str, region: &str) -> OpsError {
    OpsError::NotFound {
        identifier: identifier.to_owned(),
        region: region.to_owned(),
    }
}

fn inventory_error(err: BackendError, region: &str) -> OpsError {
    OpsError::from_backend(err, region, OpsError::ControlPlane)
}
