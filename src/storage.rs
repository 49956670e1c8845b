use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::recognize::{Confidence, VehicleCategory, VehicleRecognitionResult};

/// What a capture leaves behind: the image on disk and, when recognition
/// succeeded, its structured result.
#[derive(Clone, Debug, Serialize)]
pub struct CaptureRecord {
    pub sequence_number: u64,
    pub captured_at: DateTime<Local>,
    pub image_path: PathBuf,
    pub recognition: Option<VehicleRecognitionResult>,
    pub recognition_error: Option<String>,
}

impl CaptureRecord {
    pub fn plate(&self) -> Option<&str> {
        self.recognition.as_ref().and_then(|r| r.plate.as_deref())
    }

    pub fn category(&self) -> Option<&VehicleCategory> {
        self.recognition.as_ref().map(|r| &r.vehicle_category)
    }

    pub fn confidence(&self) -> Option<Confidence> {
        self.recognition.as_ref().and_then(|r| r.confidence)
    }
}

/// What a store did with a record it did not reject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Stored,
    /// The store chose not to keep the record; carries the reason.
    Skipped(String),
}

/// Destination for capture records.
pub trait RecordStore {
    fn name(&self) -> &str;

    fn submit(&mut self, record: &CaptureRecord) -> Result<SubmitOutcome>;
}

// -------------------- SQLite capture log --------------------

/// Row read back from the local capture log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureLogEntry {
    pub sequence_number: u64,
    pub captured_at: String,
    pub image_path: String,
    pub license_plate: Option<String>,
    pub vehicle_type: Option<String>,
    pub confidence: Option<String>,
    pub recognition_error: Option<String>,
}

pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).with_context(|| format!("open capture log {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS captures (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              sequence_number INTEGER NOT NULL,
              captured_at TEXT NOT NULL,
              image_path TEXT NOT NULL,
              license_plate TEXT,
              vehicle_type TEXT,
              confidence TEXT,
              recognition_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_captures_plate ON captures(license_plate);
            "#,
        )?;
        Ok(())
    }

    /// Most recent captures first.
    pub fn recent(&self, limit: usize) -> Result<Vec<CaptureLogEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT sequence_number, captured_at, image_path, license_plate,
                   vehicle_type, confidence, recognition_error
            FROM captures ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let sequence_number: i64 = row.get(0)?;
            Ok(CaptureLogEntry {
                sequence_number: sequence_number as u64,
                captured_at: row.get(1)?,
                image_path: row.get(2)?,
                license_plate: row.get(3)?,
                vehicle_type: row.get(4)?,
                confidence: row.get(5)?,
                recognition_error: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl RecordStore for SqliteRecordStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn submit(&mut self, record: &CaptureRecord) -> Result<SubmitOutcome> {
        let sequence_number = i64::try_from(record.sequence_number)
            .map_err(|_| anyhow!("sequence number exceeds i64 range"))?;
        self.conn.execute(
            r#"
            INSERT INTO captures(sequence_number, captured_at, image_path, license_plate,
                                 vehicle_type, confidence, recognition_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                sequence_number,
                record.captured_at.to_rfc3339(),
                record.image_path.display().to_string(),
                record.plate(),
                record.category().map(|c| c.to_string()),
                record.confidence().map(|c| c.to_string()),
                record.recognition_error,
            ],
        )?;
        Ok(SubmitOutcome::Stored)
    }
}

// -------------------- In-memory --------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    records: Vec<CaptureRecord>,
}

impl InMemoryRecordStore {
    pub fn records(&self) -> &[CaptureRecord] {
        &self.records
    }
}

impl RecordStore for InMemoryRecordStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn submit(&mut self, record: &CaptureRecord) -> Result<SubmitOutcome> {
        self.records.push(record.clone());
        Ok(SubmitOutcome::Stored)
    }
}

// -------------------- Parking API client --------------------

/// Which side of the facility the camera watches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GateRole {
    /// Register the vehicle as entering (`POST /vehicles`).
    #[default]
    Entry,
    /// Close the open visit for the plate (`PUT /vehicles/{plate}/exit`).
    Exit,
}

impl std::str::FromStr for GateRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" | "enter" => Ok(GateRole::Entry),
            "exit" => Ok(GateRole::Exit),
            other => Err(format!("unknown gate role '{}'; expected entry or exit", other)),
        }
    }
}

#[derive(Serialize)]
struct VehicleEntry<'a> {
    license_plate: &'a str,
    vehicle_type: &'a str,
}

/// Client of the parking facility API.
///
/// Only complete detections are sent: records without a plate, or entries
/// whose category is outside the set the API accepts, come back as
/// `SubmitOutcome::Skipped`.
pub struct ParkingApiStore {
    base_url: url::Url,
    role: GateRole,
    agent: ureq::Agent,
}

impl ParkingApiStore {
    pub fn new(base_url: &str, role: GateRole, timeout: Duration) -> Result<Self> {
        let base_url = url::Url::parse(base_url).context("parse parking api url")?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("parking api url {} cannot be a base", base_url));
        }
        Ok(Self {
            base_url,
            role,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        })
    }

    pub fn role(&self) -> GateRole {
        self.role
    }

    fn endpoint(&self, segments: &[&str]) -> Result<url::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("parking api url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send(&self, request: ureq::Request, body: Option<String>) -> Result<()> {
        let result = match body {
            Some(body) => request
                .set("Content-Type", "application/json")
                .send_string(&body),
            None => request.call(),
        };
        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, response)) => {
                let detail = response.into_string().unwrap_or_default();
                Err(anyhow!("parking api returned HTTP {}: {}", status, detail.trim()))
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(anyhow!("parking api unreachable: {}", transport))
            }
        }
    }
}

impl RecordStore for ParkingApiStore {
    fn name(&self) -> &str {
        "parking-api"
    }

    fn submit(&mut self, record: &CaptureRecord) -> Result<SubmitOutcome> {
        let Some(plate) = record.plate() else {
            return Ok(SubmitOutcome::Skipped("no plate recognized".into()));
        };
        match self.role {
            GateRole::Entry => {
                let Some(vehicle_type) = record.category().and_then(|c| c.api_value()) else {
                    let category = record
                        .category()
                        .map_or_else(|| "none".to_string(), |c| c.to_string());
                    return Ok(SubmitOutcome::Skipped(format!(
                        "vehicle type {} not accepted by parking api",
                        category
                    )));
                };
                let url = self.endpoint(&["vehicles"])?;
                let body = serde_json::to_string(&VehicleEntry {
                    license_plate: plate,
                    vehicle_type,
                })?;
                self.send(self.agent.post(url.as_str()), Some(body))?;
                log::info!(
                    "capture #{}: entry registered for {} ({})",
                    record.sequence_number,
                    plate,
                    vehicle_type
                );
            }
            GateRole::Exit => {
                let url = self.endpoint(&["vehicles", plate, "exit"])?;
                self.send(self.agent.put(url.as_str()), None)?;
                log::info!("capture #{}: exit registered for {}", record.sequence_number, plate);
            }
        }
        Ok(SubmitOutcome::Stored)
    }
}
