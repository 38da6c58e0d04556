use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};
use statline_core::{
    Audit, Competition, Entity, FixedClock, Fixture, MatchResult, Player, PlayerStats, Round,
    Season, Squad, SquadKey,
};
use statline_storage::{
    ApiPage, EntityStore, EntityStores, FetchError, MemoryScopeSource, MemoryStore, RateGate,
    StoreError, UpstreamClient,
};
use statline_sync::{Dispatcher, EngineTuning, RunSummary, SyncError};

/// Upstream that serves pre-recorded pages and remembers every request.
#[derive(Default)]
struct ScriptedUpstream {
    pages: HashMap<(String, u32), ApiPage>,
    failures: HashMap<String, u16>,
    calls: Mutex<Vec<(String, Vec<String>, u32)>>,
}

impl ScriptedUpstream {
    fn page(mut self, path: &str, current: u32, total: u32, items: Vec<JsonValue>) -> Self {
        self.pages.insert(
            (path.to_string(), current),
            ApiPage {
                items,
                current_page: current,
                total_pages: total,
            },
        );
        self
    }

    fn single(self, path: &str, items: Vec<JsonValue>) -> Self {
        self.page(path, 1, 1, items)
    }

    fn failing(mut self, path: &str, status: u16) -> Self {
        self.failures.insert(path.to_string(), status);
        self
    }

    fn calls(&self) -> Vec<(String, Vec<String>, u32)> {
        self.calls.lock().unwrap().clone()
    }

    fn paths(&self) -> HashSet<String> {
        self.calls().into_iter().map(|(path, _, _)| path).collect()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn fetch_page(
        &self,
        path: &str,
        includes: &[&str],
        page: u32,
    ) -> Result<ApiPage, FetchError> {
        self.calls.lock().unwrap().push((
            path.to_string(),
            includes.iter().map(|s| s.to_string()).collect(),
            page,
        ));
        if let Some(status) = self.failures.get(path) {
            return Err(FetchError::HttpStatus {
                status: *status,
                path: path.to_string(),
            });
        }
        self.pages
            .get(&(path.to_string(), page))
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                path: path.to_string(),
            })
    }
}

/// Wraps a memory store: slows lookups down and refuses selected inserts.
struct TroubledStore<R: Entity> {
    inner: Arc<MemoryStore<R>>,
    find_delay: StdDuration,
    reject_inserts: HashSet<String>,
}

#[async_trait]
impl<R: Entity> EntityStore<R> for TroubledStore<R> {
    async fn find(&self, key: &R::Key) -> Result<Option<R>, StoreError> {
        tokio::time::sleep(self.find_delay).await;
        self.inner.find(key).await
    }

    async fn insert(&self, record: &R) -> Result<(), StoreError> {
        let key = record.key().to_string();
        if self.reject_inserts.contains(&key) {
            return Err(StoreError::Conflict {
                entity: R::KIND,
                key,
            });
        }
        self.inner.insert(record).await
    }

    async fn update(&self, record: &R) -> Result<(), StoreError> {
        self.inner.update(record).await
    }
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).single().unwrap()
}

fn midnight() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).single().unwrap()
}

struct Harness {
    clock: Arc<FixedClock>,
    competitions: Arc<MemoryStore<Competition>>,
    seasons: Arc<MemoryStore<Season>>,
    rounds: Arc<MemoryStore<Round>>,
    squads: Arc<MemoryStore<Squad>>,
    players: Arc<MemoryStore<Player>>,
    fixtures: Arc<MemoryStore<Fixture>>,
    results: Arc<MemoryStore<MatchResult>>,
    player_stats: Arc<MemoryStore<PlayerStats>>,
    stores: EntityStores,
}

impl Harness {
    fn new() -> Self {
        Self::seeded(Vec::new(), Vec::new(), Vec::new())
    }

    fn seeded(
        competitions: Vec<Competition>,
        seasons: Vec<Season>,
        fixtures: Vec<Fixture>,
    ) -> Self {
        let competitions = Arc::new(MemoryStore::with_records(competitions));
        let seasons = Arc::new(MemoryStore::with_records(seasons));
        let rounds = Arc::new(MemoryStore::<Round>::new());
        let squads = Arc::new(MemoryStore::<Squad>::new());
        let players = Arc::new(MemoryStore::<Player>::new());
        let fixtures = Arc::new(MemoryStore::with_records(fixtures));
        let results = Arc::new(MemoryStore::<MatchResult>::new());
        let player_stats = Arc::new(MemoryStore::<PlayerStats>::new());

        let mut stores = EntityStores::in_memory();
        stores.competitions = competitions.clone();
        stores.seasons = seasons.clone();
        stores.rounds = rounds.clone();
        stores.squads = squads.clone();
        stores.players = players.clone();
        stores.fixtures = fixtures.clone();
        stores.results = results.clone();
        stores.player_stats = player_stats.clone();

        Self {
            clock: Arc::new(FixedClock::new(noon())),
            competitions,
            seasons,
            rounds,
            squads,
            players,
            fixtures,
            results,
            player_stats,
            stores,
        }
    }

    fn dispatcher(&self, upstream: Arc<ScriptedUpstream>, budget: u64) -> Dispatcher {
        self.dispatcher_with(upstream, budget, EngineTuning::default())
    }

    fn dispatcher_with(
        &self,
        upstream: Arc<ScriptedUpstream>,
        budget: u64,
        tuning: EngineTuning,
    ) -> Dispatcher {
        let scope = MemoryScopeSource::new(
            self.seasons.clone(),
            self.squads.clone(),
            self.fixtures.clone(),
        );
        Dispatcher::new(
            upstream,
            self.stores.clone(),
            Arc::new(scope),
            self.clock.clone(),
            Arc::new(RateGate::new(budget)),
            tuning,
        )
    }
}

fn serie_a(is_cup: bool, at: DateTime<Utc>) -> Competition {
    Competition {
        id: 564,
        name: "Serie A".to_string(),
        country_id: 32,
        is_cup,
        audit: Audit::new(at),
    }
}

fn season(id: u64, is_current: bool) -> Season {
    Season {
        id,
        name: format!("season {id}"),
        competition_id: 564,
        is_current,
        audit: Audit::new(midnight()),
    }
}

fn fixture(id: u64, date: DateTime<Utc>) -> Fixture {
    Fixture {
        id,
        season_id: 17420,
        round_id: None,
        venue_id: None,
        home_team_id: 1,
        away_team_id: 2,
        referee_id: None,
        date,
        audit: Audit::new(midnight()),
    }
}

fn round_item(id: u64, season_id: u64) -> JsonValue {
    json!({"id": id, "name": 1, "season_id": season_id, "start": "2026-03-14", "end": "2026-03-16"})
}

async fn run(dispatcher: &Dispatcher, command: &str, option: Option<&str>) -> RunSummary {
    dispatcher.run(command, option).await.unwrap()
}

#[tokio::test]
async fn new_competition_is_inserted_once_with_equal_audit_stamps() {
    let harness = Harness::new();
    let upstream = Arc::new(ScriptedUpstream::default().single(
        "leagues",
        vec![json!({"id": 564, "name": "Serie A", "country_id": 32, "is_cup": false})],
    ));
    let dispatcher = harness.dispatcher(upstream.clone(), 10);

    let summary = run(&dispatcher, "competition", None).await;

    assert_eq!((summary.created, summary.updated, summary.failed), (1, 0, 0));
    assert_eq!(harness.competitions.insert_calls(), 1);
    assert_eq!(harness.competitions.update_calls(), 0);
    let stored = harness.competitions.get(&564).await.unwrap();
    assert!(!stored.is_cup);
    assert_eq!(stored.audit.created_at, noon());
    assert_eq!(stored.audit.updated_at, noon());
    assert_eq!(upstream.calls(), vec![("leagues".to_string(), vec![], 1)]);
}

#[tokio::test]
async fn known_competition_is_updated_once_and_never_reinserted() {
    let seeded_at = noon() - Duration::days(3);
    let harness = Harness::seeded(vec![serie_a(false, seeded_at)], Vec::new(), Vec::new());
    let upstream = Arc::new(ScriptedUpstream::default().single(
        "leagues",
        vec![json!({"id": 564, "name": "Serie A", "country_id": 32, "is_cup": true})],
    ));
    let dispatcher = harness.dispatcher(upstream, 10);

    let summary = run(&dispatcher, "competition", None).await;

    assert_eq!((summary.created, summary.updated), (0, 1));
    assert_eq!(harness.competitions.insert_calls(), 0);
    assert_eq!(harness.competitions.update_calls(), 1);
    let stored = harness.competitions.get(&564).await.unwrap();
    assert_eq!(stored.name, "Serie A");
    assert!(stored.is_cup);
    assert_eq!(stored.audit.created_at, seeded_at);
    assert!(stored.audit.updated_at > seeded_at);
}

#[tokio::test]
async fn budget_of_two_reconciles_two_targets_and_still_completes() {
    let harness = Harness::new();
    let upstream = Arc::new(
        ScriptedUpstream::default()
            .single("rounds/season/16036", vec![round_item(1, 16036)])
            .single("rounds/season/17420", vec![round_item(2, 17420)])
            .single("rounds/season/18000", vec![round_item(3, 18000)]),
    );
    let dispatcher = harness.dispatcher(upstream.clone(), 2);

    let summary = run(&dispatcher, "round", Some("16036,17420,18000")).await;

    assert_eq!(summary.targets, 3);
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.created, 2);
    assert!(summary.truncated);
    assert_eq!(upstream.calls().len(), 2);
    assert_eq!(harness.rounds.snapshot().await.len(), 2);
    assert_eq!(dispatcher.gate().remaining(), 0);
}

#[tokio::test]
async fn rerunning_an_unchanged_upstream_converges_to_the_same_state() {
    let harness = Harness::new();
    let upstream = Arc::new(ScriptedUpstream::default().single(
        "leagues",
        vec![
            json!({"id": 564, "name": "Serie A", "country_id": 32, "is_cup": false}),
            json!({"id": 8, "name": "Premier League", "country_id": 462}),
        ],
    ));
    let dispatcher = harness.dispatcher(upstream, 10);

    run(&dispatcher, "competition", None).await;
    let first = harness.competitions.get(&564).await.unwrap();
    let second_run = run(&dispatcher, "competition", None).await;

    assert_eq!((second_run.created, second_run.updated), (0, 2));
    assert_eq!(harness.competitions.insert_calls(), 2);
    assert_eq!(harness.competitions.get(&564).await.unwrap(), first);
}

#[tokio::test]
async fn bad_records_are_isolated_from_their_siblings() {
    let mut harness = Harness::new();
    harness.stores.competitions = Arc::new(TroubledStore {
        inner: harness.competitions.clone(),
        find_delay: StdDuration::ZERO,
        reject_inserts: HashSet::from(["566".to_string()]),
    });
    let upstream = Arc::new(ScriptedUpstream::default().single(
        "leagues",
        vec![
            json!({"id": 564, "name": "Serie A", "country_id": 32}),
            json!({"id": 565, "country_id": 32}),
            json!({"id": 566, "name": "Coppa Italia", "country_id": 32, "is_cup": true}),
            json!({"id": 567, "name": "Serie B", "country_id": 32}),
        ],
    ));
    let dispatcher = harness.dispatcher(upstream, 10);

    let summary = run(&dispatcher, "competition", None).await;

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed, 2);
    let mut ids: Vec<u64> = harness
        .competitions
        .snapshot()
        .await
        .into_iter()
        .map(|c| c.id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![564, 567]);
}

#[tokio::test]
async fn upstream_failure_aborts_the_run() {
    let harness = Harness::new();
    let upstream = Arc::new(
        ScriptedUpstream::default()
            .single("fixtures/1", vec![json!({"id": 1, "scores": {"localteam_score": 2}})])
            .failing("fixtures/2", 500),
    );
    let dispatcher = harness.dispatcher(upstream, 10);

    let err = dispatcher.run("result", Some("1,2")).await.unwrap_err();

    match err {
        SyncError::Upstream { path, page, source } => {
            assert_eq!(path, "fixtures/2");
            assert_eq!(page, 1);
            assert!(matches!(source, FetchError::HttpStatus { status: 500, .. }));
        }
        other => panic!("expected upstream failure, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_duplicates_of_one_key_never_race() {
    let mut harness = Harness::new();
    harness.stores.competitions = Arc::new(TroubledStore {
        inner: harness.competitions.clone(),
        find_delay: StdDuration::from_millis(20),
        reject_inserts: HashSet::new(),
    });
    let serie_a = json!({"id": 564, "name": "Serie A", "country_id": 32});
    let upstream = Arc::new(
        ScriptedUpstream::default()
            .single("leagues", vec![serie_a.clone(), serie_a.clone(), serie_a]),
    );
    let tuning = EngineTuning {
        reconcile_workers: 8,
        ..EngineTuning::default()
    };
    let dispatcher = harness.dispatcher_with(upstream, 10, tuning);

    let summary = run(&dispatcher, "competition", None).await;

    assert_eq!((summary.created, summary.updated, summary.failed), (1, 2, 0));
    assert_eq!(harness.competitions.insert_calls(), 1);
    assert_eq!(harness.competitions.update_calls(), 2);
}

#[tokio::test]
async fn today_scope_only_touches_fixtures_inside_the_day() {
    let fixtures = vec![
        fixture(10, midnight() - Duration::seconds(1)),
        fixture(11, midnight()),
        fixture(12, midnight() + Duration::days(1) - Duration::seconds(1)),
        fixture(13, midnight() + Duration::days(1)),
    ];
    let harness = Harness::seeded(Vec::new(), vec![season(17420, true)], fixtures);
    let upstream = Arc::new(
        ScriptedUpstream::default()
            .single("fixtures/11", vec![json!({"id": 11, "scores": {"ft_score": "1-0"}})])
            .single("fixtures/12", vec![json!({"id": 12, "scores": {"ft_score": "2-2"}})]),
    );
    let dispatcher = harness.dispatcher(upstream.clone(), 10);

    let summary = run(&dispatcher, "result", Some("today")).await;

    assert_eq!(summary.targets, 2);
    assert_eq!(summary.created, 2);
    assert_eq!(
        upstream.paths(),
        HashSet::from(["fixtures/11".to_string(), "fixtures/12".to_string()])
    );
    let result = harness.results.get(&12).await.unwrap();
    assert_eq!(result.full_time_score.as_deref(), Some("2-2"));
}

#[tokio::test]
async fn unsupported_commands_are_fatal_before_any_fetch() {
    let harness = Harness::new();
    let upstream = Arc::new(ScriptedUpstream::default());
    let dispatcher = harness.dispatcher(upstream.clone(), 10);

    for (command, option) in [
        ("stadium", None),
        ("fixture:yesterday", None),
        ("country:today", None),
        ("team", Some("today")),
        ("season:by-id", Some("16036")),
    ] {
        let err = dispatcher.run(command, option).await.unwrap_err();
        assert!(
            matches!(err, SyncError::UnsupportedCommand { .. }),
            "{command}: {err:?}"
        );
    }
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn malformed_scope_option_is_fatal() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(Arc::new(ScriptedUpstream::default()), 10);
    let err = dispatcher.run("result", Some("12,abc")).await.unwrap_err();
    assert!(matches!(err, SyncError::Scope(_)));
}

#[tokio::test]
async fn paged_collections_are_walked_to_the_last_page() {
    let harness = Harness::new();
    let upstream = Arc::new(
        ScriptedUpstream::default()
            .page("leagues", 1, 3, vec![json!({"id": 1, "name": "A", "country_id": 1})])
            .page("leagues", 2, 3, vec![json!({"id": 2, "name": "B", "country_id": 1})])
            .page("leagues", 3, 3, vec![json!({"id": 3, "name": "C", "country_id": 1})]),
    );
    let dispatcher = harness.dispatcher(upstream.clone(), 10);

    let summary = run(&dispatcher, "competition", None).await;

    assert_eq!(summary.pages, 3);
    assert_eq!(summary.created, 3);
    assert!(!summary.truncated);
    let pages: Vec<u32> = upstream.calls().into_iter().map(|(_, _, page)| page).collect();
    assert_eq!(pages, vec![1, 2, 3]);
}

#[tokio::test]
async fn process_signals_completion_exactly_once() {
    let harness = Harness::new();
    let upstream = Arc::new(ScriptedUpstream::default().single(
        "leagues",
        vec![json!({"id": 564, "name": "Serie A", "country_id": 32})],
    ));
    let dispatcher = Arc::new(harness.dispatcher(upstream, 10));

    let done = dispatcher.process("competition", None);
    let summary = done.await.unwrap().unwrap();

    assert_eq!(summary.command, "competition");
    assert_eq!(summary.created, 1);
    assert_eq!(summary.finished_at, noon());
}

#[tokio::test]
async fn squads_of_current_seasons_drive_the_player_scope() {
    let harness = Harness::seeded(
        Vec::new(),
        vec![season(16036, false), season(17420, true)],
        Vec::new(),
    );
    let upstream = Arc::new(
        ScriptedUpstream::default()
            .single(
                "teams/season/17420",
                vec![
                    json!({"id": 1, "name": "West Ham", "squad": {"data": [{"player_id": 580}, {"player_id": 1042}]}}),
                    json!({"id": 2, "name": "Fulham", "squad": {"data": [{"player_id": 1042}]}}),
                ],
            )
            .single(
                "players/580",
                vec![json!({"player_id": 580, "display_name": "M. Antonio", "birthdate": "28/03/1990"})],
            )
            .single(
                "players/1042",
                vec![json!({"player_id": 1042, "display_name": "A. Cresswell"})],
            ),
    );
    let dispatcher = harness.dispatcher(upstream.clone(), 10);

    let squads = run(&dispatcher, "squad:current-season", None).await;
    assert_eq!(squads.created, 2);
    let west_ham = harness
        .squads
        .get(&SquadKey {
            season_id: 17420,
            team_id: 1,
        })
        .await
        .unwrap();
    assert_eq!(west_ham.player_ids, vec![580, 1042]);

    let players = run(&dispatcher, "player:current-season", None).await;
    assert_eq!(players.targets, 2);
    assert_eq!(players.created, 2);
    assert!(harness.players.get(&580).await.unwrap().birth_date.is_some());

    let squad_call = upstream
        .calls()
        .into_iter()
        .find(|(path, _, _)| path == "teams/season/17420")
        .unwrap();
    assert_eq!(squad_call.1, vec!["squad".to_string()]);
}

#[tokio::test]
async fn lineup_and_bench_are_both_reconciled_as_player_stats() {
    let harness = Harness::new();
    let upstream = Arc::new(ScriptedUpstream::default().single(
        "fixtures/11867285",
        vec![json!({
            "id": 11867285,
            "lineup": {"data": [
                {"fixture_id": 11867285, "player_id": 580, "team_id": 1, "stats": {"goals": {"scored": 2}}}
            ]},
            "bench": {"data": [
                {"fixture_id": 11867285, "player_id": 1042, "team_id": 1}
            ]}
        })],
    ));
    let dispatcher = harness.dispatcher(upstream, 10);

    let summary = run(&dispatcher, "player-stats:by-id", Some("11867285")).await;

    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.created, 2);
    let mut stats = harness.player_stats.snapshot().await;
    stats.sort_by_key(|s| s.player_id);
    assert!(!stats[0].is_substitute);
    assert_eq!(stats[0].goals_scored, Some(2));
    assert!(stats[1].is_substitute);
}
