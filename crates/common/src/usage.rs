// Daily usage records shared between the realtime tracker (sole writer) and
// reporting readers.
//
// Sessions are tagged variants in memory and a flat
// `{connect_time, disconnect_time, duration, is_merged}` document on the
// wire and in storage.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Product features whose usage time is tracked per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureModule {
    TextToImage,
    ImageToImage,
    ImageUpscale,
    Inpainting,
    BackgroundRemoval,
    VideoGeneration,
    Gallery,
    Projects,
}

impl FeatureModule {
    pub const ALL: [FeatureModule; 8] = [
        Self::TextToImage,
        Self::ImageToImage,
        Self::ImageUpscale,
        Self::Inpainting,
        Self::BackgroundRemoval,
        Self::VideoGeneration,
        Self::Gallery,
        Self::Projects,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TextToImage => "text_to_image",
            Self::ImageToImage => "image_to_image",
            Self::ImageUpscale => "image_upscale",
            Self::Inpainting => "inpainting",
            Self::BackgroundRemoval => "background_removal",
            Self::VideoGeneration => "video_generation",
            Self::Gallery => "gallery",
            Self::Projects => "projects",
        }
    }
}

impl fmt::Display for FeatureModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature module '{0}'")]
pub struct UnknownFeatureModule(pub String);

impl FromStr for FeatureModule {
    type Err = UnknownFeatureModule;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|module| module.as_str() == value)
            .ok_or_else(|| UnknownFeatureModule(value.to_string()))
    }
}

/// Milliseconds from `from` to `to`, never negative.
pub fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().max(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionDocError {
    #[error("open session must have zero duration, got {0}")]
    OpenWithDuration(i64),
    #[error("merged session must carry a disconnect time")]
    MergedWithoutDisconnect,
    #[error("session duration must not be negative, got {0}")]
    NegativeDuration(i64),
}

/// One platform session inside a daily presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "SessionDoc", try_from = "SessionDoc")]
pub enum Session {
    Open {
        connect_time: DateTime<Utc>,
    },
    Closed {
        connect_time: DateTime<Utc>,
        disconnect_time: DateTime<Utc>,
        duration_ms: i64,
    },
    /// Summary of several older sessions folded together by compaction.
    Merged {
        connect_time: DateTime<Utc>,
        disconnect_time: DateTime<Utc>,
        duration_ms: i64,
        merged_count: u32,
    },
}

impl Session {
    pub fn open(connect_time: DateTime<Utc>) -> Self {
        Self::Open { connect_time }
    }

    pub fn connect_time(&self) -> DateTime<Utc> {
        match self {
            Self::Open { connect_time }
            | Self::Closed { connect_time, .. }
            | Self::Merged { connect_time, .. } => *connect_time,
        }
    }

    pub fn disconnect_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Open { .. } => None,
            Self::Closed { disconnect_time, .. } | Self::Merged { disconnect_time, .. } => {
                Some(*disconnect_time)
            }
        }
    }

    /// Duration in milliseconds; `0` while the session is open.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::Open { .. } => 0,
            Self::Closed { duration_ms, .. } | Self::Merged { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    /// Number of raw sessions this entry stands for.
    pub fn merged_count(&self) -> u32 {
        match self {
            Self::Merged { merged_count, .. } => *merged_count,
            _ => 1,
        }
    }

    /// Close an open session at `at`. Closed and merged sessions are returned
    /// unchanged.
    pub fn close(&self, at: DateTime<Utc>) -> Self {
        match self {
            Self::Open { connect_time } => Self::Closed {
                connect_time: *connect_time,
                disconnect_time: at,
                duration_ms: elapsed_ms(*connect_time, at),
            },
            other => other.clone(),
        }
    }
}

/// Persisted shape of [`Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDoc {
    pub connect_time: DateTime<Utc>,
    pub disconnect_time: Option<DateTime<Utc>>,
    pub duration: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_count: Option<u32>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<Session> for SessionDoc {
    fn from(session: Session) -> Self {
        match session {
            Session::Open { connect_time } => Self {
                connect_time,
                disconnect_time: None,
                duration: 0,
                is_merged: false,
                merged_count: None,
            },
            Session::Closed { connect_time, disconnect_time, duration_ms } => Self {
                connect_time,
                disconnect_time: Some(disconnect_time),
                duration: duration_ms,
                is_merged: false,
                merged_count: None,
            },
            Session::Merged { connect_time, disconnect_time, duration_ms, merged_count } => Self {
                connect_time,
                disconnect_time: Some(disconnect_time),
                duration: duration_ms,
                is_merged: true,
                merged_count: Some(merged_count),
            },
        }
    }
}

impl TryFrom<SessionDoc> for Session {
    type Error = SessionDocError;

    fn try_from(doc: SessionDoc) -> Result<Self, Self::Error> {
        if doc.duration < 0 {
            return Err(SessionDocError::NegativeDuration(doc.duration));
        }

        match (doc.disconnect_time, doc.is_merged) {
            (None, true) => Err(SessionDocError::MergedWithoutDisconnect),
            (None, false) if doc.duration != 0 => {
                Err(SessionDocError::OpenWithDuration(doc.duration))
            }
            (None, false) => Ok(Session::Open { connect_time: doc.connect_time }),
            (Some(disconnect_time), false) => Ok(Session::Closed {
                connect_time: doc.connect_time,
                disconnect_time,
                duration_ms: doc.duration,
            }),
            (Some(disconnect_time), true) => Ok(Session::Merged {
                connect_time: doc.connect_time,
                disconnect_time,
                duration_ms: doc.duration,
                merged_count: doc.merged_count.unwrap_or(1),
            }),
        }
    }
}

/// A feature-usage interval for one client connection (browser tab).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ModuleSessionDoc", try_from = "ModuleSessionDoc")]
pub struct ModuleSession {
    pub client_connection_id: String,
    pub session: Session,
}

impl ModuleSession {
    pub fn open(client_connection_id: impl Into<String>, connect_time: DateTime<Utc>) -> Self {
        Self {
            client_connection_id: client_connection_id.into(),
            session: Session::open(connect_time),
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub fn duration_ms(&self) -> i64 {
        self.session.duration_ms()
    }
}

/// Persisted shape of [`ModuleSession`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSessionDoc {
    pub client_connection_id: String,
    pub connect_time: DateTime<Utc>,
    pub disconnect_time: Option<DateTime<Utc>>,
    pub duration: i64,
}

impl From<ModuleSession> for ModuleSessionDoc {
    fn from(value: ModuleSession) -> Self {
        let doc = SessionDoc::from(value.session);
        Self {
            client_connection_id: value.client_connection_id,
            connect_time: doc.connect_time,
            disconnect_time: doc.disconnect_time,
            duration: doc.duration,
        }
    }
}

impl TryFrom<ModuleSessionDoc> for ModuleSession {
    type Error = SessionDocError;

    fn try_from(doc: ModuleSessionDoc) -> Result<Self, Self::Error> {
        let session = Session::try_from(SessionDoc {
            connect_time: doc.connect_time,
            disconnect_time: doc.disconnect_time,
            duration: doc.duration,
            is_merged: false,
            merged_count: None,
        })?;
        Ok(Self { client_connection_id: doc.client_connection_id, session })
    }
}

/// Sum of durations across a session list.
pub fn total_duration_ms<'a>(sessions: impl IntoIterator<Item = &'a Session>) -> i64 {
    sessions.into_iter().map(Session::duration_ms).sum()
}

/// One user's platform presence for one day within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyPresenceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub date: NaiveDate,
    /// Sum of session durations in milliseconds.
    pub total_time: i64,
    pub sessions: Vec<Session>,
    pub is_currently_online: bool,
    pub last_activity: DateTime<Utc>,
    /// Optimistic-concurrency token. `0` until the first successful save.
    pub version: i64,
}

impl DailyPresenceRecord {
    /// A fresh, unsaved record holding a single open session.
    pub fn first_of_day(
        user_id: Uuid,
        tenant_id: Uuid,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tenant_id,
            date,
            total_time: 0,
            sessions: vec![Session::open(now)],
            is_currently_online: true,
            last_activity: now,
            version: 0,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn recompute_total_time(&mut self) {
        self.total_time = total_duration_ms(&self.sessions);
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.iter().filter(|session| session.is_open()).count()
    }
}

/// One user's time in one feature module for one day within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyModuleUsageRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub module: FeatureModule,
    pub date: NaiveDate,
    /// Distinct client connections seen for this module today.
    pub socket_ids: BTreeSet<String>,
    pub sessions: Vec<ModuleSession>,
    pub total_time: i64,
    pub last_activity: DateTime<Utc>,
    pub version: i64,
}

impl DailyModuleUsageRecord {
    pub fn empty(
        user_id: Uuid,
        tenant_id: Uuid,
        module: FeatureModule,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tenant_id,
            module,
            date,
            socket_ids: BTreeSet::new(),
            sessions: Vec::new(),
            total_time: 0,
            last_activity: now,
            version: 0,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn recompute_total_time(&mut self) {
        self.total_time = total_duration_ms(self.sessions.iter().map(|entry| &entry.session));
    }

    /// First session recorded today for `client_connection_id`, open or not.
    pub fn session_for(&self, client_connection_id: &str) -> Option<usize> {
        self.sessions.iter().position(|entry| entry.client_connection_id == client_connection_id)
    }

    pub fn open_session_for(&self, client_connection_id: &str) -> Option<usize> {
        self.sessions
            .iter()
            .position(|entry| entry.is_open() && entry.client_connection_id == client_connection_id)
    }
}
