//! Per-entity adapters: where each entity lives upstream, how a fetched item
//! breaks down into upstream records, and how those records become persisted
//! entities.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use statline_core::{
    Audit, Competition, Country, Entity, EntityKind, Fixture, FixtureSubjectKey, GoalEvent,
    MatchResult, Player, PlayerStats, Round, Season, Squad, SquadKey, SubstitutionEvent, Target,
    Team, TeamStats, Venue,
};
use thiserror::Error;

pub const CRATE_NAME: &str = "statline-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed {entity} item: {source}")]
    Malformed {
        entity: EntityKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{entity} item is missing `{field}`")]
    MissingField {
        entity: EntityKind,
        field: &'static str,
    },
    #[error("{entity} cannot be fetched for target {target}")]
    UnsupportedTarget { entity: EntityKind, target: Target },
}

/// Plug-in describing one entity kind to the sync engine.
///
/// `create` and `update` are pure: no I/O, and `now` is the only time source.
pub trait EntityAdapter: Send + Sync + 'static {
    type Upstream: DeserializeOwned + fmt::Debug + Send + Sync + 'static;
    type Record: Entity;

    fn kind(&self) -> EntityKind {
        <Self::Record as Entity>::KIND
    }

    /// Upstream collection path for one target.
    fn endpoint(&self, target: &Target) -> Result<String, AdapterError>;

    fn includes(&self) -> &'static [&'static str] {
        &[]
    }

    /// Break one fetched item into upstream records. Each record decodes
    /// independently so one malformed entry does not hide its siblings.
    fn explode(
        &self,
        _target: &Target,
        item: JsonValue,
    ) -> Vec<Result<Self::Upstream, AdapterError>> {
        vec![decode(self.kind(), item)]
    }

    fn natural_key(&self, upstream: &Self::Upstream) -> <Self::Record as Entity>::Key;

    fn create(
        &self,
        upstream: &Self::Upstream,
        now: DateTime<Utc>,
    ) -> Result<Self::Record, AdapterError>;

    fn update(
        &self,
        upstream: &Self::Upstream,
        existing: Self::Record,
        now: DateTime<Utc>,
    ) -> Result<Self::Record, AdapterError>;
}

fn decode<T: DeserializeOwned>(entity: EntityKind, item: JsonValue) -> Result<T, AdapterError> {
    serde_json::from_value(item).map_err(|source| AdapterError::Malformed { entity, source })
}

/// `item[field].data` as a list; absent or non-list yields nothing.
fn nested_items(item: &JsonValue, field: &str) -> Vec<JsonValue> {
    item.get(field)
        .and_then(|v| v.get("data"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Absent upstream values leave the stored value alone.
fn merge<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if let Some(value) = incoming {
        *slot = Some(value);
    }
}

fn collection_only(entity: EntityKind, target: &Target, path: &str) -> Result<String, AdapterError> {
    match target {
        Target::Collection => Ok(path.to_string()),
        Target::Id(_) => Err(AdapterError::UnsupportedTarget {
            entity,
            target: *target,
        }),
    }
}

fn by_id(entity: EntityKind, target: &Target, prefix: &str) -> Result<String, AdapterError> {
    match target {
        Target::Id(id) => Ok(format!("{prefix}/{id}")),
        Target::Collection => Err(AdapterError::UnsupportedTarget {
            entity,
            target: *target,
        }),
    }
}

/// Upstream IDs and names sometimes arrive as strings, sometimes as numbers.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected unsigned id, got {n}"))),
        JsonValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected numeric id, got {s:?}"))),
        other => Err(serde::de::Error::custom(format!(
            "expected id, got {other}"
        ))),
    }
}

fn lenient_opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => Ok(n.as_u64()),
        JsonValue::String(s) => Ok(s.trim().parse().ok()),
        _ => Ok(None),
    }
}

fn stringish<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string, got {other}"
        ))),
    }
}

fn narrow<T: TryFrom<u64>>(value: Option<u64>) -> Option<T> {
    value.and_then(|v| T::try_from(v).ok())
}

// ---------------------------------------------------------------------------
// Country

#[derive(Debug, Clone, Deserialize)]
pub struct CountryUpstream {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub extra: Option<CountryExtra>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CountryExtra {
    pub continent: Option<String>,
    pub sub_region: Option<String>,
    pub world_region: Option<String>,
    pub fifa: Option<String>,
    pub iso: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CountryAdapter;

impl EntityAdapter for CountryAdapter {
    type Upstream = CountryUpstream;
    type Record = Country;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        collection_only(self.kind(), target, "countries")
    }

    fn natural_key(&self, upstream: &CountryUpstream) -> u64 {
        upstream.id
    }

    fn create(&self, upstream: &CountryUpstream, now: DateTime<Utc>) -> Result<Country, AdapterError> {
        let extra = upstream.extra.clone().unwrap_or_default();
        Ok(Country {
            id: upstream.id,
            name: upstream.name.clone(),
            continent: extra.continent,
            sub_region: extra.sub_region,
            world_region: extra.world_region,
            fifa: extra.fifa,
            iso: extra.iso,
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &CountryUpstream,
        mut existing: Country,
        now: DateTime<Utc>,
    ) -> Result<Country, AdapterError> {
        let extra = upstream.extra.clone().unwrap_or_default();
        existing.name = upstream.name.clone();
        merge(&mut existing.continent, extra.continent);
        merge(&mut existing.sub_region, extra.sub_region);
        merge(&mut existing.world_region, extra.world_region);
        merge(&mut existing.fifa, extra.fifa);
        merge(&mut existing.iso, extra.iso);
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Competition

#[derive(Debug, Clone, Deserialize)]
pub struct CompetitionUpstream {
    pub id: u64,
    pub name: String,
    pub country_id: u64,
    #[serde(default)]
    pub is_cup: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompetitionAdapter;

impl EntityAdapter for CompetitionAdapter {
    type Upstream = CompetitionUpstream;
    type Record = Competition;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        collection_only(self.kind(), target, "leagues")
    }

    fn natural_key(&self, upstream: &CompetitionUpstream) -> u64 {
        upstream.id
    }

    fn create(
        &self,
        upstream: &CompetitionUpstream,
        now: DateTime<Utc>,
    ) -> Result<Competition, AdapterError> {
        Ok(Competition {
            id: upstream.id,
            name: upstream.name.clone(),
            country_id: upstream.country_id,
            is_cup: upstream.is_cup.unwrap_or(false),
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &CompetitionUpstream,
        mut existing: Competition,
        now: DateTime<Utc>,
    ) -> Result<Competition, AdapterError> {
        existing.name = upstream.name.clone();
        if let Some(is_cup) = upstream.is_cup {
            existing.is_cup = is_cup;
        }
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Season

#[derive(Debug, Clone, Deserialize)]
pub struct SeasonUpstream {
    pub id: u64,
    pub name: String,
    pub league_id: u64,
    #[serde(default)]
    pub is_current_season: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SeasonAdapter;

impl EntityAdapter for SeasonAdapter {
    type Upstream = SeasonUpstream;
    type Record = Season;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        collection_only(self.kind(), target, "seasons")
    }

    fn natural_key(&self, upstream: &SeasonUpstream) -> u64 {
        upstream.id
    }

    fn create(&self, upstream: &SeasonUpstream, now: DateTime<Utc>) -> Result<Season, AdapterError> {
        Ok(Season {
            id: upstream.id,
            name: upstream.name.clone(),
            competition_id: upstream.league_id,
            is_current: upstream.is_current_season.unwrap_or(false),
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &SeasonUpstream,
        mut existing: Season,
        now: DateTime<Utc>,
    ) -> Result<Season, AdapterError> {
        existing.name = upstream.name.clone();
        if let Some(current) = upstream.is_current_season {
            existing.is_current = current;
        }
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Round

#[derive(Debug, Clone, Deserialize)]
pub struct RoundUpstream {
    pub id: u64,
    #[serde(deserialize_with = "stringish")]
    pub name: String,
    pub season_id: u64,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoundAdapter;

impl EntityAdapter for RoundAdapter {
    type Upstream = RoundUpstream;
    type Record = Round;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "rounds/season")
    }

    fn natural_key(&self, upstream: &RoundUpstream) -> u64 {
        upstream.id
    }

    fn create(&self, upstream: &RoundUpstream, now: DateTime<Utc>) -> Result<Round, AdapterError> {
        Ok(Round {
            id: upstream.id,
            name: upstream.name.clone(),
            season_id: upstream.season_id,
            start_date: upstream.start,
            end_date: upstream.end,
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &RoundUpstream,
        mut existing: Round,
        now: DateTime<Utc>,
    ) -> Result<Round, AdapterError> {
        existing.name = upstream.name.clone();
        merge(&mut existing.start_date, upstream.start);
        merge(&mut existing.end_date, upstream.end);
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Venue

#[derive(Debug, Clone, Deserialize)]
pub struct VenueUpstream {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub surface: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VenueAdapter;

impl EntityAdapter for VenueAdapter {
    type Upstream = VenueUpstream;
    type Record = Venue;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "venues/season")
    }

    fn natural_key(&self, upstream: &VenueUpstream) -> u64 {
        upstream.id
    }

    fn create(&self, upstream: &VenueUpstream, now: DateTime<Utc>) -> Result<Venue, AdapterError> {
        Ok(Venue {
            id: upstream.id,
            name: upstream.name.clone(),
            surface: upstream.surface.clone(),
            address: upstream.address.clone(),
            city: upstream.city.clone(),
            capacity: upstream.capacity,
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &VenueUpstream,
        mut existing: Venue,
        now: DateTime<Utc>,
    ) -> Result<Venue, AdapterError> {
        existing.name = upstream.name.clone();
        merge(&mut existing.surface, upstream.surface.clone());
        merge(&mut existing.address, upstream.address.clone());
        merge(&mut existing.city, upstream.city.clone());
        merge(&mut existing.capacity, upstream.capacity);
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Team

#[derive(Debug, Clone, Deserialize)]
pub struct TeamUpstream {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub short_code: Option<String>,
    #[serde(default)]
    pub country_id: Option<u64>,
    #[serde(default)]
    pub venue_id: Option<u64>,
    #[serde(default)]
    pub national_team: Option<bool>,
    #[serde(default)]
    pub founded: Option<u16>,
    #[serde(default)]
    pub logo_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TeamAdapter;

impl EntityAdapter for TeamAdapter {
    type Upstream = TeamUpstream;
    type Record = Team;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "teams/season")
    }

    fn natural_key(&self, upstream: &TeamUpstream) -> u64 {
        upstream.id
    }

    fn create(&self, upstream: &TeamUpstream, now: DateTime<Utc>) -> Result<Team, AdapterError> {
        Ok(Team {
            id: upstream.id,
            name: upstream.name.clone(),
            short_code: upstream.short_code.clone(),
            country_id: upstream.country_id,
            venue_id: upstream.venue_id,
            is_national_team: upstream.national_team,
            founded: upstream.founded,
            logo: upstream.logo_path.clone(),
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &TeamUpstream,
        mut existing: Team,
        now: DateTime<Utc>,
    ) -> Result<Team, AdapterError> {
        existing.name = upstream.name.clone();
        merge(&mut existing.short_code, upstream.short_code.clone());
        merge(&mut existing.country_id, upstream.country_id);
        merge(&mut existing.venue_id, upstream.venue_id);
        merge(&mut existing.is_national_team, upstream.national_team);
        merge(&mut existing.founded, upstream.founded);
        merge(&mut existing.logo, upstream.logo_path.clone());
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Squad

#[derive(Debug, Clone, Deserialize)]
struct SquadTeamItem {
    id: u64,
    squad: SquadList,
}

#[derive(Debug, Clone, Deserialize)]
struct SquadList {
    #[serde(default)]
    data: Vec<SquadMember>,
}

#[derive(Debug, Clone, Deserialize)]
struct SquadMember {
    #[serde(deserialize_with = "lenient_u64")]
    player_id: u64,
}

/// A team's roster for one season. The season comes from the fetch target,
/// not from the team item.
#[derive(Debug, Clone, Deserialize)]
pub struct SquadUpstream {
    pub season_id: u64,
    pub team_id: u64,
    pub player_ids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SquadAdapter;

impl EntityAdapter for SquadAdapter {
    type Upstream = SquadUpstream;
    type Record = Squad;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "teams/season")
    }

    fn includes(&self) -> &'static [&'static str] {
        &["squad"]
    }

    fn explode(&self, target: &Target, item: JsonValue) -> Vec<Result<SquadUpstream, AdapterError>> {
        let Target::Id(season_id) = *target else {
            return vec![Err(AdapterError::UnsupportedTarget {
                entity: self.kind(),
                target: *target,
            })];
        };
        // Teams listed without a squad include carry no roster to sync.
        if item.get("squad").map_or(true, JsonValue::is_null) {
            return Vec::new();
        }
        let team = decode::<SquadTeamItem>(self.kind(), item).map(|team| {
            let mut player_ids = Vec::with_capacity(team.squad.data.len());
            for member in team.squad.data {
                if !player_ids.contains(&member.player_id) {
                    player_ids.push(member.player_id);
                }
            }
            SquadUpstream {
                season_id,
                team_id: team.id,
                player_ids,
            }
        });
        vec![team]
    }

    fn natural_key(&self, upstream: &SquadUpstream) -> SquadKey {
        SquadKey {
            season_id: upstream.season_id,
            team_id: upstream.team_id,
        }
    }

    fn create(&self, upstream: &SquadUpstream, now: DateTime<Utc>) -> Result<Squad, AdapterError> {
        Ok(Squad {
            season_id: upstream.season_id,
            team_id: upstream.team_id,
            player_ids: upstream.player_ids.clone(),
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &SquadUpstream,
        mut existing: Squad,
        now: DateTime<Utc>,
    ) -> Result<Squad, AdapterError> {
        existing.player_ids = upstream.player_ids.clone();
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Player

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerUpstream {
    pub player_id: u64,
    #[serde(default)]
    pub country_id: Option<u64>,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub nationality: Option<String>,
    /// `dd/mm/yyyy`
    #[serde(default)]
    pub birthdate: Option<String>,
    #[serde(default)]
    pub birthplace: Option<String>,
    #[serde(default)]
    pub position_id: Option<u32>,
    #[serde(default)]
    pub image_path: Option<String>,
}

impl PlayerUpstream {
    fn birth_date(&self) -> Option<NaiveDate> {
        self.birthdate
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%d/%m/%Y").ok())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerAdapter;

impl EntityAdapter for PlayerAdapter {
    type Upstream = PlayerUpstream;
    type Record = Player;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "players")
    }

    fn natural_key(&self, upstream: &PlayerUpstream) -> u64 {
        upstream.player_id
    }

    fn create(&self, upstream: &PlayerUpstream, now: DateTime<Utc>) -> Result<Player, AdapterError> {
        Ok(Player {
            id: upstream.player_id,
            country_id: upstream.country_id,
            first_name: upstream.firstname.clone(),
            last_name: upstream.lastname.clone(),
            display_name: upstream.display_name.clone(),
            nationality: upstream.nationality.clone(),
            birth_date: upstream.birth_date(),
            birth_place: upstream.birthplace.clone(),
            position_id: upstream.position_id,
            image: upstream.image_path.clone(),
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &PlayerUpstream,
        mut existing: Player,
        now: DateTime<Utc>,
    ) -> Result<Player, AdapterError> {
        merge(&mut existing.country_id, upstream.country_id);
        merge(&mut existing.first_name, upstream.firstname.clone());
        merge(&mut existing.last_name, upstream.lastname.clone());
        merge(&mut existing.display_name, upstream.display_name.clone());
        merge(&mut existing.nationality, upstream.nationality.clone());
        merge(&mut existing.birth_date, upstream.birth_date());
        merge(&mut existing.birth_place, upstream.birthplace.clone());
        merge(&mut existing.position_id, upstream.position_id);
        merge(&mut existing.image, upstream.image_path.clone());
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Fixture

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixtureTime {
    #[serde(default)]
    pub starting_at: Option<StartingAt>,
    #[serde(default)]
    pub minute: Option<u16>,
    #[serde(default)]
    pub added_time: Option<u16>,
    #[serde(default)]
    pub extra_minute: Option<u16>,
    #[serde(default)]
    pub injury_time: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartingAt {
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// `YYYY-MM-DD HH:MM:SS`, UTC
    #[serde(default)]
    pub date_time: Option<String>,
}

impl StartingAt {
    fn resolve(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .or_else(|| {
                self.date_time.as_deref().and_then(|s| {
                    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureUpstream {
    pub id: u64,
    pub season_id: u64,
    #[serde(default)]
    pub round_id: Option<u64>,
    #[serde(default)]
    pub venue_id: Option<u64>,
    pub localteam_id: u64,
    pub visitorteam_id: u64,
    #[serde(default)]
    pub referee_id: Option<u64>,
    #[serde(default)]
    pub time: FixtureTime,
}

impl FixtureUpstream {
    fn starting_at(&self) -> Option<DateTime<Utc>> {
        self.time.starting_at.as_ref().and_then(StartingAt::resolve)
    }

    fn kickoff(&self) -> Result<DateTime<Utc>, AdapterError> {
        self.starting_at().ok_or(AdapterError::MissingField {
                entity: EntityKind::Fixture,
                field: "time.starting_at",
            })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureAdapter;

impl EntityAdapter for FixtureAdapter {
    type Upstream = FixtureUpstream;
    type Record = Fixture;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "seasons")
    }

    fn includes(&self) -> &'static [&'static str] {
        &["fixtures"]
    }

    fn explode(&self, _target: &Target, item: JsonValue) -> Vec<Result<FixtureUpstream, AdapterError>> {
        nested_items(&item, "fixtures")
            .into_iter()
            .map(|fixture| decode(self.kind(), fixture))
            .collect()
    }

    fn natural_key(&self, upstream: &FixtureUpstream) -> u64 {
        upstream.id
    }

    fn create(&self, upstream: &FixtureUpstream, now: DateTime<Utc>) -> Result<Fixture, AdapterError> {
        Ok(Fixture {
            id: upstream.id,
            season_id: upstream.season_id,
            round_id: upstream.round_id,
            venue_id: upstream.venue_id,
            home_team_id: upstream.localteam_id,
            away_team_id: upstream.visitorteam_id,
            referee_id: upstream.referee_id,
            date: upstream.kickoff()?,
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &FixtureUpstream,
        mut existing: Fixture,
        now: DateTime<Utc>,
    ) -> Result<Fixture, AdapterError> {
        if let Some(kickoff) = upstream.starting_at() {
            existing.date = kickoff;
        }
        merge(&mut existing.round_id, upstream.round_id);
        merge(&mut existing.venue_id, upstream.venue_id);
        merge(&mut existing.referee_id, upstream.referee_id);
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Result

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scores {
    pub localteam_score: Option<u16>,
    pub visitorteam_score: Option<u16>,
    pub localteam_pen_score: Option<u16>,
    pub visitorteam_pen_score: Option<u16>,
    pub ht_score: Option<String>,
    pub ft_score: Option<String>,
    pub et_score: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Formations {
    pub localteam_formation: Option<String>,
    pub visitorteam_formation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Standings {
    pub localteam_position: Option<u16>,
    pub visitorteam_position: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultUpstream {
    pub id: u64,
    #[serde(default)]
    pub pitch: Option<String>,
    #[serde(default)]
    pub scores: Scores,
    #[serde(default)]
    pub formations: Formations,
    #[serde(default)]
    pub standings: Standings,
    #[serde(default)]
    pub time: FixtureTime,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAdapter;

impl EntityAdapter for ResultAdapter {
    type Upstream = ResultUpstream;
    type Record = MatchResult;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "fixtures")
    }

    fn natural_key(&self, upstream: &ResultUpstream) -> u64 {
        upstream.id
    }

    fn create(&self, upstream: &ResultUpstream, now: DateTime<Utc>) -> Result<MatchResult, AdapterError> {
        let blank = MatchResult {
            fixture_id: upstream.id,
            pitch: None,
            home_formation: None,
            away_formation: None,
            home_score: None,
            away_score: None,
            home_pen_score: None,
            away_pen_score: None,
            half_time_score: None,
            full_time_score: None,
            extra_time_score: None,
            home_league_position: None,
            away_league_position: None,
            minutes: None,
            added_time: None,
            extra_time: None,
            injury_time: None,
            audit: Audit::new(now),
        };
        Ok(apply_result(upstream, blank))
    }

    fn update(
        &self,
        upstream: &ResultUpstream,
        existing: MatchResult,
        now: DateTime<Utc>,
    ) -> Result<MatchResult, AdapterError> {
        let mut updated = apply_result(upstream, existing);
        updated.audit.touch(now);
        Ok(updated)
    }
}

fn apply_result(upstream: &ResultUpstream, mut record: MatchResult) -> MatchResult {
    let scores = &upstream.scores;
    merge(&mut record.pitch, upstream.pitch.clone());
    merge(&mut record.home_formation, upstream.formations.localteam_formation.clone());
    merge(&mut record.away_formation, upstream.formations.visitorteam_formation.clone());
    merge(&mut record.home_score, scores.localteam_score);
    merge(&mut record.away_score, scores.visitorteam_score);
    merge(&mut record.home_pen_score, scores.localteam_pen_score);
    merge(&mut record.away_pen_score, scores.visitorteam_pen_score);
    merge(&mut record.half_time_score, scores.ht_score.clone());
    merge(&mut record.full_time_score, scores.ft_score.clone());
    merge(&mut record.extra_time_score, scores.et_score.clone());
    merge(&mut record.home_league_position, upstream.standings.localteam_position);
    merge(&mut record.away_league_position, upstream.standings.visitorteam_position);
    merge(&mut record.minutes, upstream.time.minute);
    merge(&mut record.added_time, upstream.time.added_time);
    merge(&mut record.extra_time, upstream.time.extra_minute);
    merge(&mut record.injury_time, upstream.time.injury_time);
    record
}

// ---------------------------------------------------------------------------
// Goal and substitution events

#[derive(Debug, Clone, Deserialize)]
pub struct GoalUpstream {
    pub id: u64,
    pub fixture_id: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub team_id: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub player_id: u64,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub player_assist_id: Option<u64>,
    pub minute: u16,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GoalEventAdapter;

impl EntityAdapter for GoalEventAdapter {
    type Upstream = GoalUpstream;
    type Record = GoalEvent;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "fixtures")
    }

    fn includes(&self) -> &'static [&'static str] {
        &["goals"]
    }

    fn explode(&self, _target: &Target, item: JsonValue) -> Vec<Result<GoalUpstream, AdapterError>> {
        nested_items(&item, "goals")
            .into_iter()
            .map(|goal| decode(self.kind(), goal))
            .collect()
    }

    fn natural_key(&self, upstream: &GoalUpstream) -> u64 {
        upstream.id
    }

    fn create(&self, upstream: &GoalUpstream, now: DateTime<Utc>) -> Result<GoalEvent, AdapterError> {
        Ok(GoalEvent {
            id: upstream.id,
            fixture_id: upstream.fixture_id,
            team_id: upstream.team_id,
            player_id: upstream.player_id,
            player_assist_id: upstream.player_assist_id,
            minute: upstream.minute,
            score: upstream.result.clone().unwrap_or_default(),
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &GoalUpstream,
        mut existing: GoalEvent,
        now: DateTime<Utc>,
    ) -> Result<GoalEvent, AdapterError> {
        existing.player_id = upstream.player_id;
        existing.minute = upstream.minute;
        merge(&mut existing.player_assist_id, upstream.player_assist_id);
        if let Some(score) = &upstream.result {
            existing.score = score.clone();
        }
        existing.audit.touch(now);
        Ok(existing)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubstitutionUpstream {
    pub id: u64,
    pub fixture_id: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub team_id: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub player_in_id: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub player_out_id: u64,
    pub minute: u16,
    #[serde(default, alias = "injuried")]
    pub injured: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubstitutionEventAdapter;

impl EntityAdapter for SubstitutionEventAdapter {
    type Upstream = SubstitutionUpstream;
    type Record = SubstitutionEvent;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "fixtures")
    }

    fn includes(&self) -> &'static [&'static str] {
        &["substitutions"]
    }

    fn explode(
        &self,
        _target: &Target,
        item: JsonValue,
    ) -> Vec<Result<SubstitutionUpstream, AdapterError>> {
        nested_items(&item, "substitutions")
            .into_iter()
            .map(|sub| decode(self.kind(), sub))
            .collect()
    }

    fn natural_key(&self, upstream: &SubstitutionUpstream) -> u64 {
        upstream.id
    }

    fn create(
        &self,
        upstream: &SubstitutionUpstream,
        now: DateTime<Utc>,
    ) -> Result<SubstitutionEvent, AdapterError> {
        Ok(SubstitutionEvent {
            id: upstream.id,
            fixture_id: upstream.fixture_id,
            team_id: upstream.team_id,
            player_in_id: upstream.player_in_id,
            player_out_id: upstream.player_out_id,
            minute: upstream.minute,
            injured: upstream.injured,
            audit: Audit::new(now),
        })
    }

    fn update(
        &self,
        upstream: &SubstitutionUpstream,
        mut existing: SubstitutionEvent,
        now: DateTime<Utc>,
    ) -> Result<SubstitutionEvent, AdapterError> {
        existing.player_in_id = upstream.player_in_id;
        existing.player_out_id = upstream.player_out_id;
        existing.minute = upstream.minute;
        merge(&mut existing.injured, upstream.injured);
        existing.audit.touch(now);
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Player statistics

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineupStats {
    #[serde(default)]
    pub shots: ShotStats,
    #[serde(default)]
    pub goals: GoalStats,
    #[serde(default)]
    pub fouls: FoulStats,
    #[serde(default)]
    pub cards: CardStats,
    #[serde(default)]
    pub passing: PassingStats,
    #[serde(default)]
    pub other: OtherStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShotStats {
    pub shots_total: Option<u16>,
    pub shots_on_goal: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoalStats {
    pub scored: Option<u16>,
    pub conceded: Option<u16>,
    pub assists: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FoulStats {
    pub drawn: Option<u16>,
    pub committed: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CardStats {
    pub yellowcards: Option<u16>,
    pub redcards: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PassingStats {
    pub passes: Option<u16>,
    pub passes_accuracy: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OtherStats {
    pub saves: Option<u16>,
    pub minutes_played: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineupUpstream {
    pub fixture_id: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub player_id: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub team_id: u64,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub formation_position: Option<u64>,
    #[serde(default)]
    pub stats: LineupStats,
    /// Set from which include the entry came from, not from the payload.
    #[serde(skip)]
    pub bench: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerStatsAdapter;

impl EntityAdapter for PlayerStatsAdapter {
    type Upstream = LineupUpstream;
    type Record = PlayerStats;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "fixtures")
    }

    fn includes(&self) -> &'static [&'static str] {
        &["lineup", "bench"]
    }

    fn explode(&self, _target: &Target, item: JsonValue) -> Vec<Result<LineupUpstream, AdapterError>> {
        let starters = nested_items(&item, "lineup").into_iter().map(|v| (v, false));
        let bench = nested_items(&item, "bench").into_iter().map(|v| (v, true));
        starters
            .chain(bench)
            .map(|(entry, on_bench)| {
                decode::<LineupUpstream>(self.kind(), entry).map(|mut lineup| {
                    lineup.bench = on_bench;
                    lineup
                })
            })
            .collect()
    }

    fn natural_key(&self, upstream: &LineupUpstream) -> FixtureSubjectKey {
        FixtureSubjectKey {
            fixture_id: upstream.fixture_id,
            subject_id: upstream.player_id,
        }
    }

    fn create(&self, upstream: &LineupUpstream, now: DateTime<Utc>) -> Result<PlayerStats, AdapterError> {
        let blank = PlayerStats {
            fixture_id: upstream.fixture_id,
            player_id: upstream.player_id,
            team_id: upstream.team_id,
            position: None,
            formation_position: None,
            is_substitute: upstream.bench,
            minutes_played: None,
            shots_total: None,
            shots_on_goal: None,
            goals_scored: None,
            goals_conceded: None,
            assists: None,
            passes_total: None,
            passes_accuracy: None,
            fouls_committed: None,
            fouls_drawn: None,
            saves: None,
            yellow_cards: None,
            red_cards: None,
            audit: Audit::new(now),
        };
        Ok(apply_lineup(upstream, blank))
    }

    fn update(
        &self,
        upstream: &LineupUpstream,
        existing: PlayerStats,
        now: DateTime<Utc>,
    ) -> Result<PlayerStats, AdapterError> {
        let mut updated = apply_lineup(upstream, existing);
        updated.audit.touch(now);
        Ok(updated)
    }
}

fn apply_lineup(upstream: &LineupUpstream, mut record: PlayerStats) -> PlayerStats {
    let stats = &upstream.stats;
    record.is_substitute = upstream.bench;
    merge(&mut record.position, upstream.position.clone());
    merge(&mut record.formation_position, narrow(upstream.formation_position));
    merge(&mut record.minutes_played, stats.other.minutes_played);
    merge(&mut record.shots_total, stats.shots.shots_total);
    merge(&mut record.shots_on_goal, stats.shots.shots_on_goal);
    merge(&mut record.goals_scored, stats.goals.scored);
    merge(&mut record.goals_conceded, stats.goals.conceded);
    merge(&mut record.assists, stats.goals.assists);
    merge(&mut record.passes_total, stats.passing.passes);
    merge(&mut record.passes_accuracy, stats.passing.passes_accuracy);
    merge(&mut record.fouls_committed, stats.fouls.committed);
    merge(&mut record.fouls_drawn, stats.fouls.drawn);
    merge(&mut record.saves, stats.other.saves);
    merge(&mut record.yellow_cards, stats.cards.yellowcards);
    merge(&mut record.red_cards, stats.cards.redcards);
    record
}

// ---------------------------------------------------------------------------
// Team statistics

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamShots {
    pub total: Option<u16>,
    pub ongoal: Option<u16>,
    pub offgoal: Option<u16>,
    pub blocked: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamPasses {
    pub total: Option<u16>,
    pub accurate: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamAttacks {
    pub attacks: Option<u16>,
    pub dangerous_attacks: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamStatsUpstream {
    pub fixture_id: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub team_id: u64,
    #[serde(default)]
    pub shots: TeamShots,
    #[serde(default)]
    pub passes: TeamPasses,
    #[serde(default)]
    pub attacks: TeamAttacks,
    #[serde(default)]
    pub fouls: Option<u16>,
    #[serde(default)]
    pub corners: Option<u16>,
    #[serde(default)]
    pub offsides: Option<u16>,
    #[serde(default)]
    pub possessiontime: Option<u16>,
    #[serde(default)]
    pub yellowcards: Option<u16>,
    #[serde(default)]
    pub redcards: Option<u16>,
    #[serde(default)]
    pub saves: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TeamStatsAdapter;

impl EntityAdapter for TeamStatsAdapter {
    type Upstream = TeamStatsUpstream;
    type Record = TeamStats;

    fn endpoint(&self, target: &Target) -> Result<String, AdapterError> {
        by_id(self.kind(), target, "fixtures")
    }

    fn includes(&self) -> &'static [&'static str] {
        &["stats"]
    }

    fn explode(
        &self,
        _target: &Target,
        item: JsonValue,
    ) -> Vec<Result<TeamStatsUpstream, AdapterError>> {
        nested_items(&item, "stats")
            .into_iter()
            .map(|stats| decode(self.kind(), stats))
            .collect()
    }

    fn natural_key(&self, upstream: &TeamStatsUpstream) -> FixtureSubjectKey {
        FixtureSubjectKey {
            fixture_id: upstream.fixture_id,
            subject_id: upstream.team_id,
        }
    }

    fn create(&self, upstream: &TeamStatsUpstream, now: DateTime<Utc>) -> Result<TeamStats, AdapterError> {
        let blank = TeamStats {
            fixture_id: upstream.fixture_id,
            team_id: upstream.team_id,
            shots_total: None,
            shots_on_goal: None,
            shots_off_goal: None,
            shots_blocked: None,
            passes_total: None,
            passes_accuracy: None,
            attacks: None,
            dangerous_attacks: None,
            fouls: None,
            corners: None,
            offsides: None,
            possession: None,
            yellow_cards: None,
            red_cards: None,
            saves: None,
            audit: Audit::new(now),
        };
        Ok(apply_team_stats(upstream, blank))
    }

    fn update(
        &self,
        upstream: &TeamStatsUpstream,
        existing: TeamStats,
        now: DateTime<Utc>,
    ) -> Result<TeamStats, AdapterError> {
        let mut updated = apply_team_stats(upstream, existing);
        updated.audit.touch(now);
        Ok(updated)
    }
}

fn apply_team_stats(upstream: &TeamStatsUpstream, mut record: TeamStats) -> TeamStats {
    merge(&mut record.shots_total, upstream.shots.total);
    merge(&mut record.shots_on_goal, upstream.shots.ongoal);
    merge(&mut record.shots_off_goal, upstream.shots.offgoal);
    merge(&mut record.shots_blocked, upstream.shots.blocked);
    merge(&mut record.passes_total, upstream.passes.total);
    merge(&mut record.passes_accuracy, upstream.passes.accurate);
    merge(&mut record.attacks, upstream.attacks.attacks);
    merge(&mut record.dangerous_attacks, upstream.attacks.dangerous_attacks);
    merge(&mut record.fouls, upstream.fouls);
    merge(&mut record.corners, upstream.corners);
    merge(&mut record.offsides, upstream.offsides);
    merge(&mut record.possession, upstream.possessiontime);
    merge(&mut record.yellow_cards, upstream.yellowcards);
    merge(&mut record.red_cards, upstream.redcards);
    merge(&mut record.saves, upstream.saves);
    record
}
