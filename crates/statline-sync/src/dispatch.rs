//! Maps a textual command onto a scope and the matching entity engine.

use std::sync::Arc;

use statline_adapters::{
    CompetitionAdapter, CountryAdapter, EntityAdapter, FixtureAdapter, GoalEventAdapter,
    PlayerAdapter, PlayerStatsAdapter, ResultAdapter, RoundAdapter, SeasonAdapter, SquadAdapter,
    SubstitutionEventAdapter, TeamAdapter, TeamStatsAdapter, VenueAdapter,
};
use statline_core::{Clock, EntityKind, Target};
use statline_storage::{EntityStore, EntityStores, RateGate, ScopeSource, UpstreamClient};
use tokio::sync::oneshot;
use tracing::{error, info, info_span, Instrument};

use crate::engine::{RunContext, SyncEngine};
use crate::scope::{Command, ScopeError, ScopeResolver};
use crate::{EngineTuning, RunSummary, SyncError};

pub struct Dispatcher {
    client: Arc<dyn UpstreamClient>,
    stores: EntityStores,
    resolver: ScopeResolver,
    clock: Arc<dyn Clock>,
    gate: Arc<RateGate>,
    tuning: EngineTuning,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        stores: EntityStores,
        scope: Arc<dyn ScopeSource>,
        clock: Arc<dyn Clock>,
        gate: Arc<RateGate>,
        tuning: EngineTuning,
    ) -> Self {
        Self {
            client,
            stores,
            resolver: ScopeResolver::new(scope, clock.clone()),
            clock,
            gate,
            tuning: tuning.normalized(),
        }
    }

    pub fn gate(&self) -> &RateGate {
        &self.gate
    }

    /// Start a run in the background. The receiver yields exactly once, when
    /// the whole run has finished or failed.
    pub fn process(
        self: &Arc<Self>,
        command: impl Into<String>,
        option: Option<String>,
    ) -> oneshot::Receiver<Result<RunSummary, SyncError>> {
        let (done_tx, done_rx) = oneshot::channel();
        let dispatcher = Arc::clone(self);
        let command = command.into();
        tokio::spawn(async move {
            let result = dispatcher.run(&command, option.as_deref()).await;
            let _ = done_tx.send(result);
        });
        done_rx
    }

    /// Wait for a run started by [`Dispatcher::process`]. A run whose task
    /// went away without reporting is `Abandoned`.
    pub async fn completion(
        done: oneshot::Receiver<Result<RunSummary, SyncError>>,
    ) -> Result<RunSummary, SyncError> {
        done.await.unwrap_or(Err(SyncError::Abandoned))
    }

    /// Run one command to completion.
    pub async fn run(&self, command: &str, option: Option<&str>) -> Result<RunSummary, SyncError> {
        let parsed: Command = match command.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(command, error = %err, "unsupported command");
                return Err(SyncError::UnsupportedCommand {
                    command: command.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        let ctx = RunContext::new(command, self.gate.clone(), self.clock.clone(), self.tuning);
        let span = info_span!(
            "sync_run",
            run_id = %ctx.run_id,
            entity = %parsed.entity,
            command
        );

        async {
            let result = self.execute(parsed, option, &ctx).await;
            match &result {
                Ok(summary) => info!(
                    targets = summary.targets,
                    pages = summary.pages,
                    created = summary.created,
                    updated = summary.updated,
                    failed = summary.failed,
                    truncated = summary.truncated,
                    "batch complete"
                ),
                Err(err) => error!(error = %err, "run aborted"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        command: Command,
        option: Option<&str>,
        ctx: &RunContext,
    ) -> Result<RunSummary, SyncError> {
        let targets = self
            .resolver
            .resolve(&command, option)
            .await
            .map_err(|err| match err {
                ScopeError::Unsupported { .. } => SyncError::UnsupportedCommand {
                    command: ctx.command.clone(),
                    reason: err.to_string(),
                },
                other => SyncError::Scope(other),
            })?;
        info!(targets = targets.len(), "scope resolved");

        let stores = &self.stores;
        match command.entity {
            EntityKind::Country => self.drive(CountryAdapter, &stores.countries, targets, ctx).await,
            EntityKind::Competition => {
                self.drive(CompetitionAdapter, &stores.competitions, targets, ctx).await
            }
            EntityKind::Season => self.drive(SeasonAdapter, &stores.seasons, targets, ctx).await,
            EntityKind::Round => self.drive(RoundAdapter, &stores.rounds, targets, ctx).await,
            EntityKind::Venue => self.drive(VenueAdapter, &stores.venues, targets, ctx).await,
            EntityKind::Team => self.drive(TeamAdapter, &stores.teams, targets, ctx).await,
            EntityKind::Squad => self.drive(SquadAdapter, &stores.squads, targets, ctx).await,
            EntityKind::Player => self.drive(PlayerAdapter, &stores.players, targets, ctx).await,
            EntityKind::Fixture => self.drive(FixtureAdapter, &stores.fixtures, targets, ctx).await,
            EntityKind::Result => self.drive(ResultAdapter, &stores.results, targets, ctx).await,
            EntityKind::GoalEvent => {
                self.drive(GoalEventAdapter, &stores.goal_events, targets, ctx).await
            }
            EntityKind::SubstitutionEvent => {
                self.drive(SubstitutionEventAdapter, &stores.substitution_events, targets, ctx)
                    .await
            }
            EntityKind::PlayerStats => {
                self.drive(PlayerStatsAdapter, &stores.player_stats, targets, ctx).await
            }
            EntityKind::TeamStats => {
                self.drive(TeamStatsAdapter, &stores.team_stats, targets, ctx).await
            }
        }
    }

    async fn drive<A: EntityAdapter>(
        &self,
        adapter: A,
        store: &Arc<dyn EntityStore<A::Record>>,
        targets: Vec<Target>,
        ctx: &RunContext,
    ) -> Result<RunSummary, SyncError> {
        SyncEngine::new(adapter, store.clone(), self.client.clone())
            .run(targets, ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_run_reports_abandoned() {
        let (done_tx, done_rx) = oneshot::channel();
        drop(done_tx);
        let err = Dispatcher::completion(done_rx).await.unwrap_err();
        assert!(matches!(err, SyncError::Abandoned));
    }
}
