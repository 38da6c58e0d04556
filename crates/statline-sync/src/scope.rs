//! Turning `entity[:scope] [option]` into the concrete targets of a run.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use statline_core::{day_window, Clock, EntityKind, ParentScope, Target, UnknownEntity};
use statline_storage::{FixtureFilter, ScopeSource, StoreError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    AllTime,
    CurrentOnly,
    Explicit,
    ActiveToday,
}

impl ScopeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeMode::AllTime => "all",
            ScopeMode::CurrentOnly => "current-season",
            ScopeMode::Explicit => "by-id",
            ScopeMode::ActiveToday => "today",
        }
    }
}

impl fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error(transparent)]
    UnknownEntity(#[from] UnknownEntity),
    #[error("unknown scope `{0}`")]
    UnknownScope(String),
}

impl FromStr for ScopeMode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ScopeMode::AllTime),
            "current-season" => Ok(ScopeMode::CurrentOnly),
            "by-id" => Ok(ScopeMode::Explicit),
            "today" => Ok(ScopeMode::ActiveToday),
            other => Err(CommandError::UnknownScope(other.to_string())),
        }
    }
}

/// A parsed `entity[:scope]` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub entity: EntityKind,
    pub scope: Option<ScopeMode>,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (entity, scope) = match s.split_once(':') {
            Some((entity, scope)) => (entity, Some(scope.parse()?)),
            None => (s, None),
        };
        Ok(Self {
            entity: entity.parse()?,
            scope,
        })
    }
}

impl Command {
    /// An explicit suffix wins; otherwise the option decides.
    pub fn effective_mode(&self, option: Option<&str>) -> ScopeMode {
        if let Some(mode) = self.scope {
            return mode;
        }
        match option.map(str::trim).filter(|o| !o.is_empty()) {
            Some(o) if o.eq_ignore_ascii_case("today") => ScopeMode::ActiveToday,
            Some(_) => ScopeMode::Explicit,
            None => ScopeMode::AllTime,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("{entity} does not support the `{mode}` scope")]
    Unsupported { entity: EntityKind, mode: ScopeMode },
    #[error("the `{mode}` scope needs an option")]
    MissingOption { mode: ScopeMode },
    #[error("malformed option `{option}`: {reason}")]
    MalformedOption { option: String, reason: String },
    #[error("scope lookup failed: {0}")]
    Store(#[from] StoreError),
}

pub struct ScopeResolver {
    source: Arc<dyn ScopeSource>,
    clock: Arc<dyn Clock>,
}

impl ScopeResolver {
    pub fn new(source: Arc<dyn ScopeSource>, clock: Arc<dyn Clock>) -> Self {
        Self { source, clock }
    }

    pub async fn resolve(
        &self,
        command: &Command,
        option: Option<&str>,
    ) -> Result<Vec<Target>, ScopeError> {
        let entity = command.entity;
        let mode = command.effective_mode(option);
        let unsupported = ScopeError::Unsupported { entity, mode };

        let ids = match (entity.parent(), mode) {
            (ParentScope::Collection, ScopeMode::AllTime) => return Ok(vec![Target::Collection]),
            (ParentScope::Collection, _) => return Err(unsupported),
            (_, ScopeMode::Explicit) => parse_id_list(option)?,
            (ParentScope::Season, ScopeMode::AllTime) => self.source.season_ids(false).await?,
            (ParentScope::Season, ScopeMode::CurrentOnly) => self.source.season_ids(true).await?,
            (ParentScope::Player, ScopeMode::AllTime) => {
                self.source.squad_player_ids(false).await?
            }
            (ParentScope::Player, ScopeMode::CurrentOnly) => {
                self.source.squad_player_ids(true).await?
            }
            (ParentScope::Fixture, ScopeMode::AllTime) => {
                self.source.fixture_ids(FixtureFilter::All).await?
            }
            (ParentScope::Fixture, ScopeMode::CurrentOnly) => {
                self.source.fixture_ids(FixtureFilter::CurrentSeasons).await?
            }
            (ParentScope::Fixture, ScopeMode::ActiveToday) => {
                let (from, to) = day_window(self.clock.now());
                debug!(%from, %to, "resolving fixtures active today");
                self.source
                    .fixture_ids(FixtureFilter::Between(from, to))
                    .await?
            }
            (_, ScopeMode::ActiveToday) => return Err(unsupported),
        };

        Ok(ids.into_iter().map(Target::Id).collect())
    }
}

/// Comma-separated IDs, deduplicated in first-seen order.
fn parse_id_list(option: Option<&str>) -> Result<Vec<u64>, ScopeError> {
    let raw = option.map(str::trim).unwrap_or_default();
    let mut ids = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id: u64 = part.parse().map_err(|_| ScopeError::MalformedOption {
            option: raw.to_string(),
            reason: format!("`{part}` is not a numeric id"),
        })?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(ScopeError::MissingOption {
            mode: ScopeMode::Explicit,
        });
    }
    Ok(ids)
}
