//! Core domain model for statline: entities, natural keys and audit stamps.

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "statline-core";

/// Source of "now" for audit stamps and day windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Frozen clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Half-open `[start, end)` covering the UTC calendar day of `at`.
pub fn day_window(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = at
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(at);
    (start, start + Duration::days(1))
}

/// Audit stamps carried by every persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Audit {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    /// Stamp a write. `updated_at` never moves backwards, so it also never
    /// drops below `created_at`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.updated_at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Country,
    Competition,
    Season,
    Round,
    Venue,
    Team,
    Squad,
    Player,
    Fixture,
    Result,
    GoalEvent,
    SubstitutionEvent,
    PlayerStats,
    TeamStats,
}

/// What a command's target IDs refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentScope {
    /// A single walk over the whole upstream collection.
    Collection,
    Season,
    Player,
    Fixture,
}

impl EntityKind {
    pub const ALL: [EntityKind; 14] = [
        EntityKind::Country,
        EntityKind::Competition,
        EntityKind::Season,
        EntityKind::Round,
        EntityKind::Venue,
        EntityKind::Team,
        EntityKind::Squad,
        EntityKind::Player,
        EntityKind::Fixture,
        EntityKind::Result,
        EntityKind::GoalEvent,
        EntityKind::SubstitutionEvent,
        EntityKind::PlayerStats,
        EntityKind::TeamStats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Country => "country",
            EntityKind::Competition => "competition",
            EntityKind::Season => "season",
            EntityKind::Round => "round",
            EntityKind::Venue => "venue",
            EntityKind::Team => "team",
            EntityKind::Squad => "squad",
            EntityKind::Player => "player",
            EntityKind::Fixture => "fixture",
            EntityKind::Result => "result",
            EntityKind::GoalEvent => "goal-event",
            EntityKind::SubstitutionEvent => "substitution-event",
            EntityKind::PlayerStats => "player-stats",
            EntityKind::TeamStats => "team-stats",
        }
    }

    pub fn parent(&self) -> ParentScope {
        match self {
            EntityKind::Country | EntityKind::Competition | EntityKind::Season => {
                ParentScope::Collection
            }
            EntityKind::Round
            | EntityKind::Venue
            | EntityKind::Team
            | EntityKind::Squad
            | EntityKind::Fixture => ParentScope::Season,
            EntityKind::Player => ParentScope::Player,
            EntityKind::Result
            | EntityKind::GoalEvent
            | EntityKind::SubstitutionEvent
            | EntityKind::PlayerStats
            | EntityKind::TeamStats => ParentScope::Fixture,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity `{0}`")]
pub struct UnknownEntity(pub String);

impl FromStr for EntityKind {
    type Err = UnknownEntity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEntity(s.to_string()))
    }
}

/// One unit of fetch work: a whole collection, or one parent ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Collection,
    Id(u64),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Collection => f.write_str("collection"),
            Target::Id(id) => write!(f, "{id}"),
        }
    }
}

/// A persisted record addressed by an immutable natural key.
pub trait Entity:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    const KIND: EntityKind;

    fn key(&self) -> Self::Key;
    fn audit(&self) -> &Audit;
}

/// `season_id:team_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SquadKey {
    pub season_id: u64,
    pub team_id: u64,
}

impl fmt::Display for SquadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.season_id, self.team_id)
    }
}

/// `fixture_id:subject_id`, where the subject is a player or a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixtureSubjectKey {
    pub fixture_id: u64,
    pub subject_id: u64,
}

impl fmt::Display for FixtureSubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fixture_id, self.subject_id)
    }
}

macro_rules! id_keyed_entity {
    ($ty:ty, $kind:expr, $field:ident) => {
        impl Entity for $ty {
            type Key = u64;

            const KIND: EntityKind = $kind;

            fn key(&self) -> u64 {
                self.$field
            }

            fn audit(&self) -> &Audit {
                &self.audit
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Country {
    pub id: u64,
    pub name: String,
    pub continent: Option<String>,
    pub sub_region: Option<String>,
    pub world_region: Option<String>,
    pub fifa: Option<String>,
    pub iso: Option<String>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    pub id: u64,
    pub name: String,
    pub country_id: u64,
    pub is_cup: bool,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub id: u64,
    pub name: String,
    pub competition_id: u64,
    pub is_current: bool,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: u64,
    pub name: String,
    pub season_id: u64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: u64,
    pub name: String,
    pub surface: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub capacity: Option<u32>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: u64,
    pub name: String,
    pub short_code: Option<String>,
    pub country_id: Option<u64>,
    pub venue_id: Option<u64>,
    pub is_national_team: Option<bool>,
    pub founded: Option<u16>,
    pub logo: Option<String>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Squad {
    pub season_id: u64,
    pub team_id: u64,
    pub player_ids: Vec<u64>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: u64,
    pub country_id: Option<u64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub nationality: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub birth_place: Option<String>,
    pub position_id: Option<u32>,
    pub image: Option<String>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub id: u64,
    pub season_id: u64,
    pub round_id: Option<u64>,
    pub venue_id: Option<u64>,
    pub home_team_id: u64,
    pub away_team_id: u64,
    pub referee_id: Option<u64>,
    pub date: DateTime<Utc>,
    pub audit: Audit,
}

/// Final state of a fixture; keyed by the fixture it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub fixture_id: u64,
    pub pitch: Option<String>,
    pub home_formation: Option<String>,
    pub away_formation: Option<String>,
    pub home_score: Option<u16>,
    pub away_score: Option<u16>,
    pub home_pen_score: Option<u16>,
    pub away_pen_score: Option<u16>,
    pub half_time_score: Option<String>,
    pub full_time_score: Option<String>,
    pub extra_time_score: Option<String>,
    pub home_league_position: Option<u16>,
    pub away_league_position: Option<u16>,
    pub minutes: Option<u16>,
    pub added_time: Option<u16>,
    pub extra_time: Option<u16>,
    pub injury_time: Option<u16>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalEvent {
    pub id: u64,
    pub fixture_id: u64,
    pub team_id: u64,
    pub player_id: u64,
    pub player_assist_id: Option<u64>,
    pub minute: u16,
    pub score: String,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstitutionEvent {
    pub id: u64,
    pub fixture_id: u64,
    pub team_id: u64,
    pub player_in_id: u64,
    pub player_out_id: u64,
    pub minute: u16,
    pub injured: Option<bool>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub fixture_id: u64,
    pub player_id: u64,
    pub team_id: u64,
    pub position: Option<String>,
    pub formation_position: Option<u8>,
    pub is_substitute: bool,
    pub minutes_played: Option<u16>,
    pub shots_total: Option<u16>,
    pub shots_on_goal: Option<u16>,
    pub goals_scored: Option<u16>,
    pub goals_conceded: Option<u16>,
    pub assists: Option<u16>,
    pub passes_total: Option<u16>,
    pub passes_accuracy: Option<u16>,
    pub fouls_committed: Option<u16>,
    pub fouls_drawn: Option<u16>,
    pub saves: Option<u16>,
    pub yellow_cards: Option<u16>,
    pub red_cards: Option<u16>,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamStats {
    pub fixture_id: u64,
    pub team_id: u64,
    pub shots_total: Option<u16>,
    pub shots_on_goal: Option<u16>,
    pub shots_off_goal: Option<u16>,
    pub shots_blocked: Option<u16>,
    pub passes_total: Option<u16>,
    pub passes_accuracy: Option<u16>,
    pub attacks: Option<u16>,
    pub dangerous_attacks: Option<u16>,
    pub fouls: Option<u16>,
    pub corners: Option<u16>,
    pub offsides: Option<u16>,
    pub possession: Option<u16>,
    pub yellow_cards: Option<u16>,
    pub red_cards: Option<u16>,
    pub saves: Option<u16>,
    pub audit: Audit,
}

id_keyed_entity!(Country, EntityKind::Country, id);
id_keyed_entity!(Competition, EntityKind::Competition, id);
id_keyed_entity!(Season, EntityKind::Season, id);
id_keyed_entity!(Round, EntityKind::Round, id);
id_keyed_entity!(Venue, EntityKind::Venue, id);
id_keyed_entity!(Team, EntityKind::Team, id);
id_keyed_entity!(Player, EntityKind::Player, id);
id_keyed_entity!(Fixture, EntityKind::Fixture, id);
id_keyed_entity!(MatchResult, EntityKind::Result, fixture_id);
id_keyed_entity!(GoalEvent, EntityKind::GoalEvent, id);
id_keyed_entity!(SubstitutionEvent, EntityKind::SubstitutionEvent, id);

impl Entity for Squad {
    type Key = SquadKey;

    const KIND: EntityKind = EntityKind::Squad;

    fn key(&self) -> SquadKey {
        SquadKey {
            season_id: self.season_id,
            team_id: self.team_id,
        }
    }

    fn audit(&self) -> &Audit {
        &self.audit
    }
}

impl Entity for PlayerStats {
    type Key = FixtureSubjectKey;

    const KIND: EntityKind = EntityKind::PlayerStats;

    fn key(&self) -> FixtureSubjectKey {
        FixtureSubjectKey {
            fixture_id: self.fixture_id,
            subject_id: self.player_id,
        }
    }

    fn audit(&self) -> &Audit {
        &self.audit
    }
}

impl Entity for TeamStats {
    type Key = FixtureSubjectKey;

    const KIND: EntityKind = EntityKind::TeamStats;

    fn key(&self) -> FixtureSubjectKey {
        FixtureSubjectKey {
            fixture_id: self.fixture_id,
            subject_id: self.team_id,
        }
    }

    fn audit(&self) -> &Audit {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).single().unwrap()
    }

    #[test]
    fn entity_names_round_trip_through_from_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>(), Ok(kind));
        }
        assert!("fixtures".parse::<EntityKind>().is_err());
    }

    #[test]
    fn touch_keeps_created_at_and_never_regresses() {
        let mut audit = Audit::new(ts(9, 0, 0));
        audit.touch(ts(12, 0, 0));
        assert_eq!(audit.created_at, ts(9, 0, 0));
        assert_eq!(audit.updated_at, ts(12, 0, 0));

        // Clock stepped back, but still after created_at.
        audit.touch(ts(10, 0, 0));
        assert_eq!(audit.updated_at, ts(12, 0, 0));

        audit.touch(ts(8, 0, 0));
        assert_eq!(audit.created_at, ts(9, 0, 0));
        assert_eq!(audit.updated_at, ts(12, 0, 0));
    }

    #[test]
    fn day_window_is_half_open_utc_day() {
        let (start, end) = day_window(ts(15, 30, 0));
        assert_eq!(start, ts(0, 0, 0));
        assert_eq!(end, ts(0, 0, 0) + Duration::days(1));
        assert!(ts(23, 59, 59) < end);
    }

    #[test]
    fn fixed_clock_advances_on_request() {
        let clock = FixedClock::new(ts(9, 0, 0));
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), ts(9, 5, 0));
        clock.set(ts(10, 0, 0));
        assert_eq!(clock.now(), ts(10, 0, 0));
    }

    #[test]
    fn composite_keys_render_as_colon_pairs() {
        let key = SquadKey {
            season_id: 16036,
            team_id: 1,
        };
        assert_eq!(key.to_string(), "16036:1");
    }
}
